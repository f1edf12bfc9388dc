//! Playcache cache system
//!
//! Two layers share one engine:
//!
//! - **Object cache**: upstream documents (games, profiles, follow lists)
//!   resolved through a [`CacheOrchestrator`] with one of five fetch
//!   strategies.
//! - **Response cache**: buffered HTTP responses served by
//!   [`response_cache_layer`] with `ETag` / `304` support.
//!
//! Entries carry a TTL, an optional stale-while-revalidate window and tags.
//! Mutations reach both layers through [`CacheTrigger`].
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! max_entries = 1000
//! default_ttl_seconds = 300
//! default_stale_while_revalidate_seconds = 60
//!
//! [[cache.routes]]
//! prefix = "/api/games/"
//! ttl_seconds = 300
//! tags = ["catalog", "game:{last}"]
//! ```

mod clock;
mod config;
mod context;
mod error;
mod events;
mod fingerprint;
mod freshness;
mod invalidation;
mod keys;
mod lock;
mod metrics;
mod orchestrator;
mod response;
mod store;
mod tags;
mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ResponseCachePolicy, RoutePolicy, default_routes};
pub use context::{CacheContext, OBJECT_LAYER, RESPONSE_LAYER, WorkerHandles};
pub use error::{CacheError, FetchError, FingerprintError};
pub use events::EventKind;
pub use fingerprint::{fingerprint, fingerprint_bytes, if_none_match_matches, matches};
pub use freshness::{Freshness, evaluate, is_expired, is_fresh, is_stale_but_revalidatable};
pub use invalidation::{
    Epoch, InvalidationQueue, InvalidationStrategy, Invalidator, QueuedInvalidation,
};
pub use keys::{CATALOG_TAG, EntityKey, PRIVATE_TAG, RequestKey};
pub use metrics::{
    CacheMetrics, DEFAULT_DEGRADED_UTILIZATION, HealthReport, HealthStatus, MetricsSnapshot,
};
pub use orchestrator::{CacheOrchestrator, CacheStatus, FetchStrategy, Resolved};
pub use response::{
    CachedResponse, InFlightRevalidations, ResponseCacheState, X_CACHE, response_cache_layer,
    response_fingerprint, should_store_response,
};
pub use store::{CacheEntry, EntryOptions, EntryStore, Fingerprinter, Lookup, json_fingerprint};
pub use tags::TagIndex;
pub use trigger::{CacheTrigger, Invalidated};

/// Metric names, for telemetry registration.
pub mod metric_names {
    pub use super::metrics::{
        METRIC_CONSUME_MS, METRIC_EVICT_TOTAL, METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_MS,
        METRIC_HIT_TOTAL, METRIC_LOOKUP_MS, METRIC_MISS_TOTAL, METRIC_QUEUE_DROPPED_TOTAL,
        METRIC_QUEUE_LEN, METRIC_SIZE, METRIC_STALE_HIT_TOTAL,
    };
}

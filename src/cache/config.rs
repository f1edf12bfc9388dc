//! Cache configuration.
//!
//! Controls the object cache, the HTTP response cache and their background
//! workers via the `[cache]` section of `playcache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::keys::PRIVATE_TAG;
use super::metrics::DEFAULT_DEGRADED_UTILIZATION;
use super::store::EntryOptions;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_RESPONSE_MAX_ENTRIES: usize = 500;
const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_STALE_WHILE_REVALIDATE_SECONDS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_BACKGROUND_INVALIDATION_INTERVAL_MS: u64 = 5000;
const DEFAULT_INVALIDATION_DELAY_MS: u64 = 1000;
const DEFAULT_LAZY_RETENTION_SECONDS: u64 = 300;
const DEFAULT_QUEUE_LIMIT: usize = 10_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_RESPONSE_BODY_LIMIT_BYTES: usize = 1024 * 1024;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Placeholder in route tags replaced by the last path segment.
const LAST_SEGMENT: &str = "{last}";
/// Placeholder in route tags expanded once per id in the `ids` query parameter.
const QUERY_IDS: &str = "{ids}";

/// Caching rules for every response whose path starts with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoutePolicy {
    pub prefix: String,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub stale_while_revalidate_seconds: Option<u64>,
    /// Tags attached to each stored response. `{last}` expands to the last
    /// path segment, so `game:{last}` on `/api/games/42` becomes `game:42`.
    /// `{ids}` yields one tag per id of a comma-separated `ids` query
    /// parameter: `game:{ids}` on `/api/games?ids=1,2` becomes `game:1` and
    /// `game:2`.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Request headers that partition the cache key.
    #[serde(default)]
    pub vary: Vec<String>,
    /// Entries are scoped to the caller's credentials and never shared.
    #[serde(default)]
    pub private: bool,
}

impl RoutePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn stale_window(&self) -> Option<Duration> {
        self.stale_while_revalidate_seconds.map(Duration::from_secs)
    }

    pub fn entry_options(&self, path: &str, query: Option<&str>) -> EntryOptions {
        let last = path.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or("");
        let ids = query_ids(query);

        let mut options = EntryOptions::new(self.ttl()).tags(self.tags.iter().flat_map(|tag| {
            let tag = tag.replace(LAST_SEGMENT, last);
            if tag.contains(QUERY_IDS) {
                ids.iter().map(|id| tag.replace(QUERY_IDS, id)).collect()
            } else {
                vec![tag]
            }
        }));
        if let Some(window) = self.stale_window() {
            options = options.stale_while_revalidate(window);
        }
        if self.private {
            options = options.tag(PRIVATE_TAG);
        }
        options
    }

    pub fn cache_control(&self) -> String {
        let scope = if self.private { "private" } else { "public" };
        match self.stale_while_revalidate_seconds {
            Some(swr) => format!(
                "{scope}, max-age={}, stale-while-revalidate={swr}",
                self.ttl_seconds
            ),
            None => format!("{scope}, max-age={}", self.ttl_seconds),
        }
    }
}

fn query_ids(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == "ids")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Prefix-matched policy table; the longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct ResponseCachePolicy {
    routes: Vec<RoutePolicy>,
}

impl ResponseCachePolicy {
    pub fn new(mut routes: Vec<RoutePolicy>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    pub fn match_path(&self, path: &str) -> Option<&RoutePolicy> {
        self.routes
            .iter()
            .find(|route| path.starts_with(route.prefix.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Cache configuration from `playcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the object cache.
    pub enabled: bool,
    /// Enable the HTTP response cache.
    pub enable_response_cache: bool,
    /// Maximum entries in the object cache.
    pub max_entries: usize,
    /// Maximum responses in the response cache.
    pub response_max_entries: usize,
    pub default_ttl_seconds: u64,
    pub default_stale_while_revalidate_seconds: Option<u64>,
    /// Expiry sweep interval (ms).
    pub sweep_interval_ms: u64,
    /// Background invalidation consumer interval (ms).
    pub background_invalidation_interval_ms: u64,
    /// Delay applied by the `delayed` invalidation strategy (ms).
    pub invalidation_delay_ms: u64,
    /// Queued invalidations older than this are collected.
    pub lazy_retention_seconds: u64,
    /// Maximum pending invalidations; overflow drops the oldest.
    pub queue_limit: usize,
    /// Maximum invalidations applied per consumption batch.
    pub consume_batch_limit: usize,
    /// Utilization above which health reports `degraded`.
    pub degraded_utilization: f64,
    /// Responses larger than this are served but not stored.
    pub response_body_limit_bytes: usize,
    /// Upper bound on each fetch; `None` waits indefinitely.
    pub fetch_timeout_ms: Option<u64>,
    pub routes: Vec<RoutePolicy>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_response_cache: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            response_max_entries: DEFAULT_RESPONSE_MAX_ENTRIES,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            default_stale_while_revalidate_seconds: Some(DEFAULT_STALE_WHILE_REVALIDATE_SECONDS),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            background_invalidation_interval_ms: DEFAULT_BACKGROUND_INVALIDATION_INTERVAL_MS,
            invalidation_delay_ms: DEFAULT_INVALIDATION_DELAY_MS,
            lazy_retention_seconds: DEFAULT_LAZY_RETENTION_SECONDS,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            degraded_utilization: DEFAULT_DEGRADED_UTILIZATION,
            response_body_limit_bytes: DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
            fetch_timeout_ms: Some(DEFAULT_FETCH_TIMEOUT_MS),
            routes: default_routes(),
        }
    }
}

/// Catalog routes: single games are tagged with their id, batches with every
/// requested id, and every catalog response with `catalog`.
pub fn default_routes() -> Vec<RoutePolicy> {
    vec![
        RoutePolicy {
            prefix: "/api/games/".to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            stale_while_revalidate_seconds: Some(DEFAULT_STALE_WHILE_REVALIDATE_SECONDS),
            tags: vec!["catalog".to_string(), "game:{last}".to_string()],
            vary: vec!["accept-language".to_string()],
            private: false,
        },
        RoutePolicy {
            prefix: "/api/games".to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            stale_while_revalidate_seconds: Some(DEFAULT_STALE_WHILE_REVALIDATE_SECONDS),
            tags: vec!["catalog".to_string(), "game:{ids}".to_string()],
            vary: vec!["accept-language".to_string()],
            private: false,
        },
    ]
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            enable_response_cache: settings.enable_response_cache,
            max_entries: settings.max_entries.get(),
            response_max_entries: settings.response_max_entries.get(),
            default_ttl_seconds: settings.default_ttl.as_secs(),
            default_stale_while_revalidate_seconds: settings
                .default_stale_while_revalidate
                .map(|window| window.as_secs()),
            sweep_interval_ms: duration_ms(settings.sweep_interval),
            background_invalidation_interval_ms: duration_ms(
                settings.background_invalidation_interval,
            ),
            invalidation_delay_ms: duration_ms(settings.invalidation_delay),
            lazy_retention_seconds: settings.lazy_retention.as_secs(),
            queue_limit: settings.queue_limit.get(),
            consume_batch_limit: settings.consume_batch_limit.get(),
            degraded_utilization: settings.degraded_utilization,
            response_body_limit_bytes: settings.response_body_limit_bytes,
            fetch_timeout_ms: settings.fetch_timeout.map(duration_ms),
            routes: settings.routes.iter().map(RoutePolicy::from).collect(),
        }
    }
}

impl From<&crate::config::RouteSettings> for RoutePolicy {
    fn from(route: &crate::config::RouteSettings) -> Self {
        Self {
            prefix: route.prefix.clone(),
            ttl_seconds: route.ttl_seconds,
            stale_while_revalidate_seconds: route.stale_while_revalidate_seconds,
            tags: route.tags.clone(),
            vary: route.vary.clone(),
            private: route.private,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CacheConfig {
    /// Returns true if any cache layer is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled || self.enable_response_cache
    }

    /// Object cache capacity, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Response cache capacity, clamping to 1 if zero.
    pub fn response_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.response_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Lifetime applied to object cache writes that do not choose their own.
    pub fn default_entry_options(&self) -> EntryOptions {
        let options = EntryOptions::new(Duration::from_secs(self.default_ttl_seconds));
        match self.default_stale_while_revalidate_seconds {
            Some(swr) => options.stale_while_revalidate(Duration::from_secs(swr)),
            None => options,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn background_invalidation_interval(&self) -> Duration {
        Duration::from_millis(self.background_invalidation_interval_ms.max(1))
    }

    pub fn invalidation_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation_delay_ms)
    }

    pub fn lazy_retention(&self) -> Duration {
        Duration::from_secs(self.lazy_retention_seconds)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn response_policies(&self) -> ResponseCachePolicy {
        ResponseCachePolicy::new(self.routes.clone())
    }
}

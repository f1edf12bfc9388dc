//! Process-wide cache wiring.
//!
//! A [`CacheContext`] is built once at startup from [`CacheConfig`] and
//! handed to services and routers; nothing in the cache is global.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::invalidation::{InvalidationQueue, Invalidator};
use super::metrics::CacheMetrics;
use super::orchestrator::CacheOrchestrator;
use super::response::{CachedResponse, ResponseCacheState, response_fingerprint};
use super::store::EntryStore;
use super::trigger::CacheTrigger;

pub const OBJECT_LAYER: &str = "object";
pub const RESPONSE_LAYER: &str = "response";

#[derive(Clone)]
pub struct CacheContext {
    config: Arc<CacheConfig>,
    objects: CacheOrchestrator<Value>,
    responses: ResponseCacheState,
    trigger: CacheTrigger,
}

impl CacheContext {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build both layers on `clock`. Tests pass a manual clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let object_store = Arc::new(EntryStore::<Value>::new(
            config.max_entries_non_zero(),
            Arc::clone(&clock),
            Arc::new(CacheMetrics::new(
                OBJECT_LAYER,
                config.max_entries_non_zero().get(),
                config.degraded_utilization,
            )),
        ));
        let objects = orchestrator(&config, object_store, config.enabled);

        let response_store = Arc::new(EntryStore::<CachedResponse>::with_fingerprinter(
            config.response_max_entries_non_zero(),
            clock,
            Arc::new(CacheMetrics::new(
                RESPONSE_LAYER,
                config.response_max_entries_non_zero().get(),
                config.degraded_utilization,
            )),
            response_fingerprint,
        ));
        let response_cache =
            orchestrator(&config, response_store, config.enable_response_cache);

        let trigger = CacheTrigger::new(&config, objects.clone(), response_cache.clone());
        let responses = ResponseCacheState::new(&config, response_cache);

        Self {
            config: Arc::new(config),
            objects,
            responses,
            trigger,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn objects(&self) -> &CacheOrchestrator<Value> {
        &self.objects
    }

    pub fn responses(&self) -> &ResponseCacheState {
        &self.responses
    }

    pub fn trigger(&self) -> &CacheTrigger {
        &self.trigger
    }

    /// Drop every entry and pending invalidation in both layers.
    pub fn clear(&self) -> usize {
        let cleared = self.objects.clear() + self.responses.cache().clear();
        info!(cleared, "Cache cleared");
        cleared
    }

    /// Start the expiry sweep and the background invalidation consumer.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn spawn_workers(&self) -> WorkerHandles {
        if !self.config.is_enabled() {
            debug!("Cache workers not started: cache disabled");
            return WorkerHandles::default();
        }

        let sweeper = {
            let context = self.clone();
            spawn_periodic(self.config.sweep_interval(), move || {
                let swept =
                    context.objects.sweep_expired() + context.responses.cache().sweep_expired();
                if swept > 0 {
                    debug!(swept, "Expired cache entries swept");
                }
            })
        };

        let consumer = {
            let context = self.clone();
            spawn_periodic(self.config.background_invalidation_interval(), move || {
                context.objects.consume_background();
                context.responses.cache().consume_background();
            })
        };

        info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            background_interval_ms = self.config.background_invalidation_interval_ms,
            "Cache workers started"
        );
        WorkerHandles {
            handles: vec![sweeper, consumer],
        }
    }
}

fn orchestrator<V>(
    config: &CacheConfig,
    store: Arc<EntryStore<V>>,
    enabled: bool,
) -> CacheOrchestrator<V>
where
    V: Clone + Send + Sync + 'static,
{
    let invalidator = Invalidator::new(
        Arc::clone(&store),
        Arc::new(InvalidationQueue::new(config.queue_limit)),
        config.invalidation_delay(),
        config.lazy_retention(),
        config.consume_batch_limit,
    );
    CacheOrchestrator::new(store, invalidator, config.fetch_timeout(), enabled)
}

fn spawn_periodic<F>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            tick();
        }
    })
}

/// Handles of the background cache workers.
#[derive(Default)]
pub struct WorkerHandles {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandles {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every worker and wait for it to stop.
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

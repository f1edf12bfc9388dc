//! Fetch-strategy orchestration.
//!
//! `CacheOrchestrator` answers "give me the value for this key" by combining
//! the entry store with an injected fetch callback according to a
//! [`FetchStrategy`]. Fetches are single-flight: concurrent requests for a
//! key that is already being fetched await the same shared future, and the
//! write-through happens once per flight.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::error::{CacheError, FetchError};
use super::freshness::{self, Freshness};
use super::invalidation::{InvalidationStrategy, Invalidator};
use super::metrics::{HealthReport, MetricsSnapshot};
use super::store::{CacheEntry, EntryOptions, EntryStore, http_date};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    /// Serve any servable cached value; fetch only on a miss.
    #[default]
    CacheFirst,
    /// Fetch first; fall back to any cached value if the fetch fails.
    NetworkFirst,
    /// Never fetch.
    CacheOnly,
    /// Always fetch, never read the cache, still write through.
    NetworkOnly,
    /// Serve any servable cached value and refresh it in the background.
    StaleWhileRevalidate,
}

impl FetchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cache-first" => Ok(Self::CacheFirst),
            "network-first" => Ok(Self::NetworkFirst),
            "cache-only" => Ok(Self::CacheOnly),
            "network-only" => Ok(Self::NetworkOnly),
            "stale-while-revalidate" => Ok(Self::StaleWhileRevalidate),
            other => Err(format!("unknown fetch strategy `{other}`")),
        }
    }
}

/// Where a resolved value came from, suitable for an `X-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }

    fn from_freshness(freshness: Freshness) -> Self {
        match freshness {
            Freshness::Fresh => Self::Hit,
            Freshness::Stale | Freshness::Expired => Self::Stale,
        }
    }
}

/// A value together with its cache metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<V> {
    pub value: V,
    pub status: CacheStatus,
    pub fingerprint: String,
    pub created_at: OffsetDateTime,
}

impl<V: Clone> Resolved<V> {
    fn from_entry(entry: &CacheEntry<V>, status: CacheStatus) -> Self {
        Self {
            value: entry.value.clone(),
            status,
            fingerprint: entry.fingerprint.clone(),
            created_at: entry.created_at,
        }
    }
}

impl<V> Resolved<V> {
    pub fn last_modified(&self) -> String {
        http_date(self.created_at)
    }
}

type Flight<V> = Shared<BoxFuture<'static, Result<Arc<CacheEntry<V>>, CacheError>>>;

struct Inner<V> {
    store: Arc<EntryStore<V>>,
    invalidator: Invalidator<V>,
    in_flight: DashMap<String, Flight<V>>,
    fetch_timeout: Option<Duration>,
    enabled: bool,
}

/// Cloneable handle to one cache layer.
pub struct CacheOrchestrator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheOrchestrator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheOrchestrator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A disabled layer never reads or writes `store`: every strategy but
    /// cache-only goes straight to the fetch, and cache-only finds nothing.
    pub fn new(
        store: Arc<EntryStore<V>>,
        invalidator: Invalidator<V>,
        fetch_timeout: Option<Duration>,
        enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                invalidator,
                in_flight: DashMap::new(),
                fetch_timeout,
                enabled,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn store(&self) -> &Arc<EntryStore<V>> {
        &self.inner.store
    }

    fn layer(&self) -> &'static str {
        self.inner.store.metrics().layer()
    }

    /// Resolve `key` according to `strategy`.
    ///
    /// `Ok(None)` is only possible under [`FetchStrategy::CacheOnly`].
    pub async fn resolve<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        strategy: FetchStrategy,
        options: &EntryOptions,
    ) -> Result<Option<Resolved<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        self.inner.invalidator.consume_lazy();

        if !self.inner.enabled {
            return match strategy {
                FetchStrategy::CacheOnly => Ok(None),
                _ => self.fetch_through(key, fetch, options).await.map(Some),
            };
        }

        match strategy {
            FetchStrategy::CacheOnly => Ok(self.cached(key, strategy)),
            FetchStrategy::CacheFirst => match self.cached(key, strategy) {
                Some(hit) => Ok(Some(hit)),
                None => self.fetch_through(key, fetch, options).await.map(Some),
            },
            FetchStrategy::NetworkOnly => self.fetch_through(key, fetch, options).await.map(Some),
            FetchStrategy::NetworkFirst => match self.fetch_through(key, fetch, options).await {
                Ok(resolved) => Ok(Some(resolved)),
                Err(err) => match self.fallback(key) {
                    Some(resolved) => {
                        warn!(
                            layer = self.layer(),
                            key,
                            strategy = %strategy,
                            outcome = "fallback",
                            error = %err,
                            "Fetch failed, serving cached value"
                        );
                        Ok(Some(resolved))
                    }
                    None => Err(err),
                },
            },
            FetchStrategy::StaleWhileRevalidate => match self.cached(key, strategy) {
                Some(hit) => {
                    self.spawn_refresh(key, fetch, options);
                    Ok(Some(hit))
                }
                None => self.fetch_through(key, fetch, options).await.map(Some),
            },
        }
    }

    /// Resolve many keys with one batch fetch for the ones that need it.
    ///
    /// Results are positionally aligned with `keys`. Duplicate keys are
    /// fetched once. `batch_fetch` only receives keys that were not served
    /// from the cache, unless the strategy always goes to the network.
    /// `None` means the key is absent upstream (or, under cache-only, not
    /// cached). A failed network-first batch is served from cached copies
    /// only when every fetched key has one; otherwise the error is returned.
    pub async fn resolve_many<B, Fut, O>(
        &self,
        keys: &[String],
        batch_fetch: B,
        strategy: FetchStrategy,
        options_for: O,
    ) -> Result<Vec<Option<V>>, CacheError>
    where
        B: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<String, V>, FetchError>> + Send + 'static,
        O: Fn(&str) -> EntryOptions + Send + Sync + 'static,
    {
        self.inner.invalidator.consume_lazy();

        let batch_fetch = Arc::new(batch_fetch);
        let options_for = Arc::new(options_for);

        let mut seen = HashSet::new();
        let unique: Vec<String> = keys
            .iter()
            .filter(|key| seen.insert(key.as_str()))
            .cloned()
            .collect();

        let mut found: HashMap<String, V> = HashMap::with_capacity(unique.len());
        let mut cached = Vec::new();
        let mut missing = Vec::new();

        match strategy {
            _ if !self.inner.enabled => missing = unique,
            FetchStrategy::NetworkOnly | FetchStrategy::NetworkFirst => missing = unique,
            _ => {
                for key in unique {
                    match self.inner.store.get(&key) {
                        Some(lookup) => {
                            found.insert(key.clone(), lookup.entry.value.clone());
                            cached.push(key);
                        }
                        None => missing.push(key),
                    }
                }
            }
        }

        if strategy == FetchStrategy::CacheOnly {
            missing.clear();
        }

        if strategy == FetchStrategy::StaleWhileRevalidate && !cached.is_empty() {
            let this = self.clone();
            let batch_fetch = Arc::clone(&batch_fetch);
            let options_for = Arc::clone(&options_for);
            tokio::spawn(async move {
                if let Err(err) = this
                    .fetch_batch(cached, batch_fetch.as_ref(), options_for.as_ref())
                    .await
                {
                    warn!(
                        layer = this.layer(),
                        strategy = "stale-while-revalidate",
                        outcome = "refresh_failed",
                        error = %err,
                        "Background batch refresh failed"
                    );
                }
            });
        }

        if !missing.is_empty() {
            debug!(
                layer = self.layer(),
                strategy = %strategy,
                missing = missing.len(),
                "Batch fetch"
            );
            match self
                .fetch_batch(missing.clone(), batch_fetch.as_ref(), options_for.as_ref())
                .await
            {
                Ok(fetched) => found.extend(fetched),
                Err(err) if strategy == FetchStrategy::NetworkFirst => {
                    let mut fallbacks = HashMap::with_capacity(missing.len());
                    for key in &missing {
                        match self.inner.store.peek_any(key) {
                            Some(entry) => {
                                fallbacks.insert(key.clone(), entry.value.clone());
                            }
                            None => return Err(err),
                        }
                    }
                    warn!(
                        layer = self.layer(),
                        strategy = %strategy,
                        outcome = "fallback",
                        fallbacks = fallbacks.len(),
                        error = %err,
                        "Batch fetch failed, serving cached values"
                    );
                    found.extend(fallbacks);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(keys.iter().map(|key| found.get(key).cloned()).collect())
    }

    pub fn invalidate(&self, key: &str, strategy: InvalidationStrategy) -> bool {
        self.inner.invalidator.invalidate(key, strategy)
    }

    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        self.inner.invalidator.invalidate_by_tags(tags)
    }

    /// Apply queued lazy invalidations. Every read path calls this first.
    pub fn consume_lazy(&self) -> usize {
        self.inner.invalidator.consume_lazy()
    }

    /// Apply queued background invalidations. Called by the worker.
    pub fn consume_background(&self) -> usize {
        self.inner.invalidator.consume_background()
    }

    pub fn sweep_expired(&self) -> usize {
        self.inner.store.sweep_expired()
    }

    pub fn pending_invalidations(&self) -> usize {
        self.inner.invalidator.queue().len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.store.metrics().snapshot()
    }

    pub fn health(&self) -> HealthReport {
        self.inner.store.metrics().health()
    }

    pub fn clear(&self) -> usize {
        self.inner.invalidator.queue().clear();
        self.inner.store.clear()
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    fn cached(&self, key: &str, strategy: FetchStrategy) -> Option<Resolved<V>> {
        match self.inner.store.get(key) {
            Some(lookup) => Some(Resolved::from_entry(
                &lookup.entry,
                CacheStatus::from_freshness(lookup.freshness),
            )),
            None => {
                debug!(
                    layer = self.layer(),
                    key,
                    strategy = %strategy,
                    outcome = "miss",
                    "cache miss"
                );
                None
            }
        }
    }

    /// Network-first fallback: any physically present entry qualifies.
    fn fallback(&self, key: &str) -> Option<Resolved<V>> {
        let entry = self.inner.store.peek_any(key)?;
        let now = self.inner.store.clock().now();
        let status = CacheStatus::from_freshness(freshness::evaluate::<V>(now, &entry));
        match status {
            CacheStatus::Hit => self.inner.store.metrics().record_hit(),
            _ => self.inner.store.metrics().record_stale_hit(),
        }
        Some(Resolved::from_entry(&entry, status))
    }

    async fn fetch_through<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: &EntryOptions,
    ) -> Result<Resolved<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let flight = self.join_or_start(key, fetch, options);
        let outcome = flight.clone().await;
        self.land(key, &flight);
        outcome.map(|entry| Resolved::from_entry(&entry, CacheStatus::Miss))
    }

    fn spawn_refresh<F, Fut>(&self, key: &str, fetch: F, options: &EntryOptions)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let flight = self.join_or_start(key, fetch, options);
        let this = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = flight.clone().await;
            this.land(&key, &flight);
            if let Err(err) = outcome {
                warn!(
                    layer = this.layer(),
                    key = %key,
                    strategy = "stale-while-revalidate",
                    outcome = "refresh_failed",
                    error = %err,
                    "Background refresh failed"
                );
            }
        });
    }

    /// Join the in-flight fetch for `key`, or start one with `fetch`.
    fn join_or_start<F, Fut>(&self, key: &str, fetch: F, options: &EntryOptions) -> Flight<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        self.inner
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| {
                let store = Arc::clone(&self.inner.store);
                let timeout = self.inner.fetch_timeout;
                let enabled = self.inner.enabled;
                let options = options.clone();
                let key = key.to_string();

                async move {
                    let started = Instant::now();
                    let outcome = with_timeout(timeout, fetch()).await;
                    store.metrics().record_fetch(started.elapsed(), outcome.is_err());

                    let value = outcome.map_err(|err| CacheError::fetch(key.clone(), err))?;
                    if enabled {
                        store.set(key, value, &options)
                    } else {
                        store.entry(key, value, &options)
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Forget a finished flight, unless a newer one already replaced it.
    fn land(&self, key: &str, flight: &Flight<V>) {
        self.inner
            .in_flight
            .remove_if(key, |_, current| current.ptr_eq(flight));
    }

    async fn fetch_batch<B, Fut, O>(
        &self,
        keys: Vec<String>,
        batch_fetch: &B,
        options_for: &O,
    ) -> Result<HashMap<String, V>, CacheError>
    where
        B: Fn(Vec<String>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<HashMap<String, V>, FetchError>> + Send,
        O: Fn(&str) -> EntryOptions + Send + Sync,
    {
        let started = Instant::now();
        let outcome = with_timeout(self.inner.fetch_timeout, batch_fetch(keys.clone())).await;
        let metrics = self.inner.store.metrics();
        metrics.record_fetch(started.elapsed(), outcome.is_err());

        let mut fetched = outcome.map_err(|err| CacheError::fetch(keys.join(","), err))?;
        let mut written = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = fetched.remove(&key) {
                if self.inner.enabled {
                    self.inner
                        .store
                        .set(key.clone(), value.clone(), &options_for(&key))?;
                }
                written.insert(key, value);
            }
        }
        Ok(written)
    }
}

async fn with_timeout<T, Fut>(limit: Option<Duration>, fetch: Fut) -> Result<T, FetchError>
where
    Fut: Future<Output = Result<T, FetchError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fetch)
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }),
        None => fetch.await,
    }
}

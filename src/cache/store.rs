//! Bounded entry store.
//!
//! Entries live in an LRU table next to their tag index, both behind one
//! mutex: a write, an eviction or a tag invalidation is atomic with respect
//! to every other store operation. Expired entries are removed lazily on
//! lookup and eagerly by [`EntryStore::sweep_expired`].

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::debug;

use super::clock::Clock;
use super::error::{CacheError, FingerprintError};
use super::fingerprint::fingerprint;
use super::freshness::{self, Freshness};
use super::lock::mutex_lock;
use super::metrics::CacheMetrics;
use super::tags::TagIndex;

const SOURCE: &str = "cache::store";

/// Computes the entity tag of a value at write time.
pub type Fingerprinter<V> = fn(&V) -> Result<String, FingerprintError>;

pub fn json_fingerprint<V: Serialize>(value: &V) -> Result<String, FingerprintError> {
    fingerprint(value, None)
}

/// One cached value and its lifecycle metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: OffsetDateTime,
    pub ttl: Duration,
    pub stale_while_revalidate: Option<Duration>,
    pub tags: HashSet<String>,
    pub fingerprint: String,
}

impl<V> CacheEntry<V> {
    /// `created_at` as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
    pub fn last_modified(&self) -> String {
        http_date(self.created_at)
    }
}

const HTTP_DATE: &[BorrowedFormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Render an IMF-fixdate.
pub(crate) fn http_date(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

/// Parse an IMF-fixdate; anything else is `None`.
pub(crate) fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Lifetime and tags for a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOptions {
    pub ttl: Duration,
    pub stale_while_revalidate: Option<Duration>,
    pub tags: HashSet<String>,
}

impl EntryOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_while_revalidate: None,
            tags: HashSet::new(),
        }
    }

    pub fn stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = Some(window);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A lookup result: the entry plus how fresh it was at lookup time.
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub entry: Arc<CacheEntry<V>>,
    pub freshness: Freshness,
}

struct StoreInner<V> {
    entries: LruCache<String, Arc<CacheEntry<V>>>,
    tags: TagIndex,
}

pub struct EntryStore<V> {
    inner: Mutex<StoreInner<V>>,
    capacity: NonZeroUsize,
    clock: Arc<dyn Clock>,
    metrics: Arc<CacheMetrics>,
    fingerprinter: Fingerprinter<V>,
}

impl<V: Serialize> EntryStore<V> {
    /// A store that fingerprints values from their JSON form.
    pub fn new(capacity: NonZeroUsize, clock: Arc<dyn Clock>, metrics: Arc<CacheMetrics>) -> Self {
        Self::with_fingerprinter(capacity, clock, metrics, json_fingerprint::<V>)
    }
}

impl<V> EntryStore<V> {
    pub fn with_fingerprinter(
        capacity: NonZeroUsize,
        clock: Arc<dyn Clock>,
        metrics: Arc<CacheMetrics>,
        fingerprinter: Fingerprinter<V>,
    ) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: LruCache::new(capacity),
                tags: TagIndex::new(),
            }),
            capacity,
            clock,
            metrics,
            fingerprinter,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Look up a servable entry, promoting it in the LRU order.
    ///
    /// An expired entry is removed on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Lookup<V>> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "get");

        let found = inner
            .entries
            .get(key)
            .map(|entry| (Arc::clone(entry), freshness::evaluate::<V>(now, entry)));

        let lookup = match found {
            Some((_, Freshness::Expired)) => {
                inner.entries.pop(key);
                inner.tags.remove_key(key);
                self.metrics.record_evictions(1, "expired");
                self.metrics.set_size(inner.entries.len());
                debug!(
                    layer = self.metrics.layer(),
                    key,
                    outcome = "expired",
                    "cache entry expired"
                );
                None
            }
            Some((entry, freshness)) => Some(Lookup { entry, freshness }),
            None => None,
        };
        drop(inner);

        match &lookup {
            Some(Lookup {
                freshness: Freshness::Stale,
                ..
            }) => self.metrics.record_stale_hit(),
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        self.metrics.record_cache_latency(started.elapsed());

        lookup
    }

    /// Any physically present entry, regardless of freshness.
    ///
    /// Does not promote the entry, evict it, or touch hit/miss counters.
    pub fn peek_any(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        mutex_lock(&self.inner, SOURCE, "peek_any")
            .entries
            .peek(key)
            .cloned()
    }

    /// Write `value` under `key`, replacing any previous entry.
    ///
    /// The fingerprint is computed first; a value that cannot be fingerprinted
    /// is never stored. At capacity the least recently used entry is evicted.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: V,
        options: &EntryOptions,
    ) -> Result<Arc<CacheEntry<V>>, CacheError> {
        let key = key.into();
        let entry = self.entry(key.clone(), value, options)?;

        let mut inner = mutex_lock(&self.inner, SOURCE, "set");
        inner.tags.insert(&key, &entry.tags);
        let displaced = inner.entries.push(key.clone(), Arc::clone(&entry));

        if let Some((evicted_key, _)) = displaced
            && evicted_key != key
        {
            inner.tags.remove_key(&evicted_key);
            self.metrics.record_evictions(1, "capacity");
            debug!(
                layer = self.metrics.layer(),
                key = %evicted_key,
                outcome = "evicted",
                "cache entry evicted for capacity"
            );
        }
        self.metrics.set_size(inner.entries.len());

        Ok(entry)
    }

    /// Build the entry `set` would write, without writing it.
    pub fn entry(
        &self,
        key: impl Into<String>,
        value: V,
        options: &EntryOptions,
    ) -> Result<Arc<CacheEntry<V>>, CacheError> {
        let key = key.into();
        let fingerprint =
            (self.fingerprinter)(&value).map_err(|err| CacheError::fingerprint(key.clone(), err))?;

        Ok(Arc::new(CacheEntry {
            key,
            value,
            created_at: self.clock.now(),
            ttl: options.ttl,
            stale_while_revalidate: options.stale_while_revalidate,
            tags: options.tags.clone(),
            fingerprint,
        }))
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = mutex_lock(&self.inner, SOURCE, "delete");
        let removed = inner.entries.pop(key).is_some();
        if removed {
            inner.tags.remove_key(key);
            self.metrics.record_evictions(1, "invalidated");
            self.metrics.set_size(inner.entries.len());
        }
        removed
    }

    /// Remove every entry whose tags intersect `tags`. Returns the count.
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate_by_tags");
        let keys = inner.tags.keys_for_tags(tags);

        let mut removed = 0;
        for key in &keys {
            inner.tags.remove_key(key);
            if inner.entries.pop(key).is_some() {
                removed += 1;
            }
        }

        self.metrics.record_evictions(removed as u64, "invalidated");
        self.metrics.set_size(inner.entries.len());
        removed
    }

    /// Drop every expired entry. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "sweep_expired");

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| freshness::is_expired::<V>(now, entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.pop(key);
            inner.tags.remove_key(key);
        }

        self.metrics.record_evictions(expired.len() as u64, "expired");
        self.metrics.set_size(inner.entries.len());
        expired.len()
    }

    /// Drop every entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.tags.clear();

        self.metrics.record_evictions(dropped as u64, "invalidated");
        self.metrics.set_size(0);
        dropped
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Keys currently tagged with any of `tags`.
    pub fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> HashSet<String> {
        mutex_lock(&self.inner, SOURCE, "keys_for_tags")
            .tags
            .keys_for_tags(tags)
    }
}

//! Key invalidation with deferred strategies.
//!
//! `immediate` removes the entry on the spot and `delayed` removes it after
//! a fixed delay on a tokio task. `lazy` and `background` enqueue the key: lazy
//! entries are applied on the next orchestrator access, background entries by
//! the periodic worker. Queued invalidations past the retention window are
//! applied when collected, never discarded.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;
use super::metrics::{METRIC_CONSUME_MS, METRIC_QUEUE_DROPPED_TOTAL, METRIC_QUEUE_LEN};
use super::store::EntryStore;

const SOURCE: &str = "cache::invalidation";

/// Monotonic sequence number of a queued invalidation.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    #[default]
    Immediate,
    Delayed,
    Lazy,
    Background,
}

impl InvalidationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Delayed => "delayed",
            Self::Lazy => "lazy",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvalidationStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "immediate" => Ok(Self::Immediate),
            "delayed" => Ok(Self::Delayed),
            "lazy" => Ok(Self::Lazy),
            "background" => Ok(Self::Background),
            other => Err(format!("unknown invalidation strategy `{other}`")),
        }
    }
}

/// A pending invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInvalidation {
    /// Unique identifier for log correlation.
    pub id: Uuid,
    pub epoch: Epoch,
    pub key: String,
    pub strategy: InvalidationStrategy,
    pub enqueued_at: OffsetDateTime,
}

/// Bounded FIFO of pending invalidations.
///
/// Overflow drops the oldest entry and counts it.
pub struct InvalidationQueue {
    queue: Mutex<VecDeque<QueuedInvalidation>>,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
    limit: usize,
}

impl InvalidationQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(
        &self,
        key: impl Into<String>,
        strategy: InvalidationStrategy,
        now: OffsetDateTime,
    ) -> QueuedInvalidation {
        let entry = QueuedInvalidation {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            key: key.into(),
            strategy,
            enqueued_at: now,
        };

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        while queue.len() >= self.limit {
            if let Some(oldest) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_QUEUE_DROPPED_TOTAL).increment(1);
                warn!(
                    invalidation_id = %oldest.id,
                    key = %oldest.key,
                    strategy = %oldest.strategy,
                    limit = self.limit,
                    "Invalidation queue full, dropped oldest entry"
                );
            }
        }
        queue.push_back(entry.clone());
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        drop(queue);

        debug!(
            invalidation_id = %entry.id,
            epoch = entry.epoch,
            key = %entry.key,
            strategy = %entry.strategy,
            "Invalidation enqueued"
        );
        entry
    }

    /// Remove up to `limit` entries queued with `strategy`, oldest first.
    pub fn drain(&self, strategy: InvalidationStrategy, limit: usize) -> Vec<QueuedInvalidation> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());

        for entry in queue.drain(..) {
            if taken.len() < limit && entry.strategy == strategy {
                taken.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        *queue = kept;
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        taken
    }

    /// Remove and return every entry enqueued more than `retention` ago.
    pub fn expire_older_than(
        &self,
        now: OffsetDateTime,
        retention: Duration,
    ) -> Vec<QueuedInvalidation> {
        let cutoff = now - retention;
        let mut queue = mutex_lock(&self.queue, SOURCE, "expire_older_than");
        let mut expired = Vec::new();
        queue.retain(|entry| {
            if entry.enqueued_at < cutoff {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        expired
    }

    pub fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.queue, SOURCE, "contains")
            .iter()
            .any(|entry| entry.key == key)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}

/// Applies invalidations to one store.
pub struct Invalidator<V> {
    store: Arc<EntryStore<V>>,
    queue: Arc<InvalidationQueue>,
    delay: Duration,
    retention: Duration,
    batch_limit: usize,
}

impl<V: Send + Sync + 'static> Invalidator<V> {
    pub fn new(
        store: Arc<EntryStore<V>>,
        queue: Arc<InvalidationQueue>,
        delay: Duration,
        retention: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            queue,
            delay,
            retention,
            batch_limit: batch_limit.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    /// Invalidate `key` with `strategy`.
    ///
    /// Returns whether an entry was removed synchronously.
    pub fn invalidate(&self, key: &str, strategy: InvalidationStrategy) -> bool {
        let layer = self.store.metrics().layer();
        match strategy {
            InvalidationStrategy::Immediate => {
                let removed = self.store.delete(key);
                info!(layer, key, strategy = %strategy, removed, "Cache key invalidated");
                removed
            }
            InvalidationStrategy::Delayed => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let store = Arc::clone(&self.store);
                    let delay = self.delay;
                    let owned_key = key.to_string();
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let removed = store.delete(&owned_key);
                        info!(
                            layer,
                            key = %owned_key,
                            strategy = "delayed",
                            removed,
                            "Cache key invalidated"
                        );
                    });
                    false
                }
                Err(_) => {
                    warn!(
                        layer,
                        key,
                        strategy = %strategy,
                        "No runtime for delayed invalidation, removing now"
                    );
                    self.store.delete(key)
                }
            },
            InvalidationStrategy::Lazy | InvalidationStrategy::Background => {
                self.queue.publish(key, strategy, self.store.clock().now());
                false
            }
        }
    }

    /// Remove every entry tagged with any of `tags`. Returns the count.
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let removed = self.store.invalidate_by_tags(tags);
        info!(
            layer = self.store.metrics().layer(),
            tags = ?tags.iter().map(|tag| tag.as_ref()).collect::<Vec<&str>>(),
            removed,
            "Cache tags invalidated"
        );
        removed
    }

    /// Apply queued lazy invalidations.
    pub fn consume_lazy(&self) -> usize {
        self.consume(InvalidationStrategy::Lazy)
    }

    /// Apply queued background invalidations.
    pub fn consume_background(&self) -> usize {
        self.consume(InvalidationStrategy::Background)
    }

    fn consume(&self, strategy: InvalidationStrategy) -> usize {
        let started = Instant::now();
        let mut applied = self.collect_expired();

        let batch = self.queue.drain(strategy, self.batch_limit);
        if batch.is_empty() && applied == 0 {
            return 0;
        }

        for queued in &batch {
            self.store.delete(&queued.key);
        }
        applied += batch.len();

        info!(
            layer = self.store.metrics().layer(),
            strategy = %strategy,
            applied,
            epochs = ?batch.iter().map(|q| q.epoch).collect::<Vec<_>>(),
            "Queued invalidations applied"
        );
        histogram!(METRIC_CONSUME_MS, "strategy" => strategy.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        applied
    }

    /// Apply and remove queue entries older than the retention window.
    fn collect_expired(&self) -> usize {
        let expired = self
            .queue
            .expire_older_than(self.store.clock().now(), self.retention);
        for queued in &expired {
            self.store.delete(&queued.key);
            debug!(
                invalidation_id = %queued.id,
                key = %queued.key,
                strategy = %queued.strategy,
                "Retention elapsed, invalidation applied"
            );
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::{Value, json};
    use time::macros::datetime;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::metrics::{CacheMetrics, DEFAULT_DEGRADED_UTILIZATION};
    use crate::cache::store::EntryOptions;

    fn setup(queue_limit: usize) -> (Invalidator<Value>, Arc<EntryStore<Value>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let metrics = Arc::new(CacheMetrics::new("object", 16, DEFAULT_DEGRADED_UTILIZATION));
        let store = Arc::new(EntryStore::new(
            NonZeroUsize::new(16).expect("capacity"),
            clock.clone(),
            metrics,
        ));
        let queue = Arc::new(InvalidationQueue::new(queue_limit));
        let invalidator = Invalidator::new(
            Arc::clone(&store),
            queue,
            Duration::from_millis(20),
            Duration::from_secs(300),
            100,
        );
        (invalidator, store, clock)
    }

    fn seed(store: &EntryStore<Value>, key: &str) {
        store
            .set(key, json!(key), &EntryOptions::new(Duration::from_secs(600)))
            .expect("set");
    }

    #[test]
    fn strategies_parse_from_lowercase() {
        assert_eq!(
            "background".parse::<InvalidationStrategy>(),
            Ok(InvalidationStrategy::Background)
        );
        assert!("eventually".parse::<InvalidationStrategy>().is_err());
        assert_eq!(InvalidationStrategy::default(), InvalidationStrategy::Immediate);
    }

    #[test]
    fn epochs_are_monotonic() {
        let queue = InvalidationQueue::new(8);
        let now = datetime!(2024-05-01 12:00 UTC);
        let a = queue.publish("a", InvalidationStrategy::Lazy, now);
        let b = queue.publish("b", InvalidationStrategy::Lazy, now);
        assert!(a.epoch < b.epoch);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = InvalidationQueue::new(2);
        let now = datetime!(2024-05-01 12:00 UTC);
        queue.publish("a", InvalidationStrategy::Lazy, now);
        queue.publish("b", InvalidationStrategy::Lazy, now);
        queue.publish("c", InvalidationStrategy::Lazy, now);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert!(!queue.contains("a"));
    }

    #[test]
    fn drain_only_takes_matching_strategy_in_order() {
        let queue = InvalidationQueue::new(8);
        let now = datetime!(2024-05-01 12:00 UTC);
        queue.publish("a", InvalidationStrategy::Lazy, now);
        queue.publish("b", InvalidationStrategy::Background, now);
        queue.publish("c", InvalidationStrategy::Lazy, now);
        queue.publish("d", InvalidationStrategy::Lazy, now);

        let lazy = queue.drain(InvalidationStrategy::Lazy, 2);
        let keys: Vec<_> = lazy.iter().map(|q| q.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(queue.len(), 2);
        assert!(queue.contains("b"));
        assert!(queue.contains("d"));
    }

    #[test]
    fn immediate_removes_now() {
        let (invalidator, store, _) = setup(8);
        seed(&store, "game:1");

        assert!(invalidator.invalidate("game:1", InvalidationStrategy::Immediate));
        assert!(store.peek_any("game:1").is_none());
        assert!(!invalidator.invalidate("game:1", InvalidationStrategy::Immediate));
        assert_eq!(store.metrics().snapshot().evictions, 1);
    }

    #[test]
    fn lazy_waits_for_consumption() {
        let (invalidator, store, _) = setup(8);
        seed(&store, "profile:1");

        assert!(!invalidator.invalidate("profile:1", InvalidationStrategy::Lazy));
        assert!(store.peek_any("profile:1").is_some());

        assert_eq!(invalidator.consume_background(), 0);
        assert_eq!(invalidator.consume_lazy(), 1);
        assert!(store.peek_any("profile:1").is_none());
        assert!(invalidator.queue().is_empty());
    }

    #[test]
    fn retention_applies_instead_of_discarding() {
        let (invalidator, store, clock) = setup(8);
        seed(&store, "library:1");
        invalidator.invalidate("library:1", InvalidationStrategy::Background);

        clock.advance(Duration::from_secs(301));
        assert_eq!(invalidator.consume_lazy(), 1);
        assert!(store.peek_any("library:1").is_none());
        assert!(invalidator.queue().is_empty());
    }

    #[test]
    fn expire_older_than_keeps_recent_entries() {
        let queue = InvalidationQueue::new(8);
        let start = datetime!(2024-05-01 12:00 UTC);
        queue.publish("old", InvalidationStrategy::Lazy, start);
        queue.publish("new", InvalidationStrategy::Lazy, start + Duration::from_secs(200));

        let expired =
            queue.expire_older_than(start + Duration::from_secs(400), Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "old");
        assert!(queue.contains("new"));
    }

    #[tokio::test]
    async fn delayed_removes_after_the_delay() {
        let (invalidator, store, _) = setup(8);
        seed(&store, "game:2");

        assert!(!invalidator.invalidate("game:2", InvalidationStrategy::Delayed));
        assert!(store.peek_any("game:2").is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.peek_any("game:2").is_none());
    }

    #[test]
    fn delayed_without_runtime_removes_now() {
        let (invalidator, store, _) = setup(8);
        seed(&store, "game:3");
        assert!(invalidator.invalidate("game:3", InvalidationStrategy::Delayed));
    }

    #[test]
    fn tag_invalidation_counts_removed_entries() {
        let (invalidator, store, _) = setup(8);
        let options = EntryOptions::new(Duration::from_secs(600)).tag("catalog");
        store.set("game:1", json!(1), &options).expect("set");
        store.set("game:2", json!(2), &options).expect("set");

        assert_eq!(invalidator.invalidate_by_tags(&["catalog"]), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn queue_recovers_from_poisoned_lock() {
        let queue = InvalidationQueue::new(8);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish("a", InvalidationStrategy::Lazy, datetime!(2024-05-01 12:00 UTC));
        assert_eq!(queue.len(), 1);
    }
}

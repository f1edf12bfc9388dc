//! Cache metrics and health.
//!
//! `CacheMetrics` keeps in-process counters and moving averages for the
//! admin snapshot, and mirrors every observation to the `metrics` facade so
//! an installed recorder sees the same numbers. Reading a snapshot never
//! touches cache state.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::metrics";

pub const METRIC_HIT_TOTAL: &str = "playcache_cache_hit_total";
pub const METRIC_STALE_HIT_TOTAL: &str = "playcache_cache_stale_hit_total";
pub const METRIC_MISS_TOTAL: &str = "playcache_cache_miss_total";
pub const METRIC_EVICT_TOTAL: &str = "playcache_cache_evict_total";
pub const METRIC_SIZE: &str = "playcache_cache_size";
pub const METRIC_LOOKUP_MS: &str = "playcache_cache_lookup_ms";
pub const METRIC_FETCH_MS: &str = "playcache_cache_fetch_ms";
pub const METRIC_FETCH_ERROR_TOTAL: &str = "playcache_cache_fetch_error_total";
pub const METRIC_QUEUE_LEN: &str = "playcache_cache_invalidation_queue_len";
pub const METRIC_QUEUE_DROPPED_TOTAL: &str = "playcache_cache_invalidation_dropped_total";
pub const METRIC_CONSUME_MS: &str = "playcache_cache_consume_ms";

/// Smoothing factor of every moving average.
pub const EMA_ALPHA: f64 = 0.2;

/// Utilization above which a layer reports itself degraded.
pub const DEFAULT_DEGRADED_UTILIZATION: f64 = 0.9;

#[derive(Debug, Default, Clone, Copy)]
struct MovingAverages {
    cache_latency_ms: Option<f64>,
    network_latency_ms: Option<f64>,
    error_rate: Option<f64>,
}

fn ema(current: Option<f64>, sample: f64) -> f64 {
    match current {
        Some(avg) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * avg,
        None => sample,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub layer: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub size: usize,
    pub max_size: usize,
    pub evictions: u64,
    pub hit_rate: f64,
    pub network_latency_ema_ms: f64,
    pub cache_latency_ema_ms: f64,
    pub error_rate_ema: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub layer: &'static str,
    pub status: HealthStatus,
    pub utilization: f64,
}

/// Counters and averages for one cache layer (`object` or `response`).
#[derive(Debug)]
pub struct CacheMetrics {
    layer: &'static str,
    max_size: usize,
    degraded_utilization: f64,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
    size: AtomicUsize,
    averages: RwLock<MovingAverages>,
}

impl CacheMetrics {
    pub fn new(layer: &'static str, max_size: usize, degraded_utilization: f64) -> Self {
        Self {
            layer,
            max_size,
            degraded_utilization,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            averages: RwLock::new(MovingAverages::default()),
        }
    }

    pub fn layer(&self) -> &'static str {
        self.layer
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT_TOTAL, "layer" => self.layer).increment(1);
    }

    /// A stale hit is still a hit; it is additionally counted on its own.
    pub fn record_stale_hit(&self) {
        self.record_hit();
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STALE_HIT_TOTAL, "layer" => self.layer).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS_TOTAL, "layer" => self.layer).increment(1);
    }

    /// `reason` is one of `capacity`, `expired` or `invalidated`.
    pub fn record_evictions(&self, count: u64, reason: &'static str) {
        if count == 0 {
            return;
        }
        self.evictions.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_EVICT_TOTAL, "layer" => self.layer, "reason" => reason).increment(count);
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Relaxed);
        gauge!(METRIC_SIZE, "layer" => self.layer).set(size as f64);
    }

    pub fn record_cache_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        histogram!(METRIC_LOOKUP_MS, "layer" => self.layer).record(ms);
        let mut averages = rw_write(&self.averages, SOURCE, "record_cache_latency");
        averages.cache_latency_ms = Some(ema(averages.cache_latency_ms, ms));
    }

    /// Records one upstream fetch: its latency and whether it failed.
    pub fn record_fetch(&self, elapsed: Duration, failed: bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        histogram!(METRIC_FETCH_MS, "layer" => self.layer).record(ms);
        if failed {
            counter!(METRIC_FETCH_ERROR_TOTAL, "layer" => self.layer).increment(1);
        }

        let sample = if failed { 1.0 } else { 0.0 };
        let mut averages = rw_write(&self.averages, SOURCE, "record_fetch");
        averages.network_latency_ms = Some(ema(averages.network_latency_ms, ms));
        averages.error_rate = Some(ema(averages.error_rate, sample));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        let averages = *rw_read(&self.averages, SOURCE, "snapshot");

        MetricsSnapshot {
            layer: self.layer,
            hits,
            misses,
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            max_size: self.max_size,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
            network_latency_ema_ms: averages.network_latency_ms.unwrap_or(0.0),
            cache_latency_ema_ms: averages.cache_latency_ms.unwrap_or(0.0),
            error_rate_ema: averages.error_rate.unwrap_or(0.0),
        }
    }

    pub fn health(&self) -> HealthReport {
        let size = self.size.load(Ordering::Relaxed);
        let utilization = if self.max_size == 0 {
            0.0
        } else {
            size as f64 / self.max_size as f64
        };
        let status = if utilization > self.degraded_utilization {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            layer: self.layer,
            status,
            utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_without_observations() {
        let metrics = CacheMetrics::new("object", 10, DEFAULT_DEGRADED_UTILIZATION);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.error_rate_ema, 0.0);
    }

    #[test]
    fn stale_hits_count_as_hits() {
        let metrics = CacheMetrics::new("object", 10, DEFAULT_DEGRADED_UTILIZATION);
        metrics.record_hit();
        metrics.record_stale_hit();
        metrics.record_miss();
        metrics.record_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.stale_hits, 1);
        assert_eq!(snapshot.misses, 2);
        assert_eq!(snapshot.hit_rate, 0.5);
    }

    #[test]
    fn first_sample_seeds_the_average() {
        let metrics = CacheMetrics::new("object", 10, DEFAULT_DEGRADED_UTILIZATION);
        metrics.record_fetch(Duration::from_millis(100), false);
        assert!((metrics.snapshot().network_latency_ema_ms - 100.0).abs() < 1e-9);

        metrics.record_fetch(Duration::from_millis(200), true);
        let snapshot = metrics.snapshot();
        assert!((snapshot.network_latency_ema_ms - 120.0).abs() < 1e-9);
        assert!((snapshot.error_rate_ema - EMA_ALPHA).abs() < 1e-9);
    }

    #[test]
    fn zero_evictions_are_not_recorded() {
        let metrics = CacheMetrics::new("response", 10, DEFAULT_DEGRADED_UTILIZATION);
        metrics.record_evictions(0, "capacity");
        metrics.record_evictions(3, "invalidated");
        assert_eq!(metrics.snapshot().evictions, 3);
    }

    #[test]
    fn health_degrades_above_threshold() {
        let metrics = CacheMetrics::new("object", 10, DEFAULT_DEGRADED_UTILIZATION);

        metrics.set_size(9);
        let report = metrics.health();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!((report.utilization - 0.9).abs() < 1e-9);

        metrics.set_size(10);
        assert_eq!(metrics.health().status, HealthStatus::Degraded);
    }

    #[test]
    fn empty_capacity_reports_healthy() {
        let metrics = CacheMetrics::new("object", 0, DEFAULT_DEGRADED_UTILIZATION);
        assert_eq!(metrics.health().status, HealthStatus::Healthy);
    }
}

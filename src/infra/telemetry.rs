use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_CONSUME_MS, METRIC_EVICT_TOTAL, METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_MS,
    METRIC_HIT_TOTAL, METRIC_LOOKUP_MS, METRIC_MISS_TOTAL, METRIC_QUEUE_DROPPED_TOTAL,
    METRIC_QUEUE_LEN, METRIC_SIZE, METRIC_STALE_HIT_TOTAL,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT_TOTAL,
            Unit::Count,
            "Total number of cache hits, stale hits included, per layer."
        );
        describe_counter!(
            METRIC_STALE_HIT_TOTAL,
            Unit::Count,
            "Total number of hits served from the stale-while-revalidate window."
        );
        describe_counter!(
            METRIC_MISS_TOTAL,
            Unit::Count,
            "Total number of cache misses, expired entries included."
        );
        describe_counter!(
            METRIC_EVICT_TOTAL,
            Unit::Count,
            "Total number of removed entries by reason (capacity, expired, invalidated)."
        );
        describe_gauge!(
            METRIC_SIZE,
            Unit::Count,
            "Current number of entries per layer."
        );
        describe_histogram!(
            METRIC_LOOKUP_MS,
            Unit::Milliseconds,
            "Cache lookup latency in milliseconds."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Upstream fetch latency in milliseconds."
        );
        describe_counter!(
            METRIC_FETCH_ERROR_TOTAL,
            Unit::Count,
            "Total number of failed upstream fetches."
        );
        describe_gauge!(
            METRIC_QUEUE_LEN,
            Unit::Count,
            "Current number of pending queued invalidations."
        );
        describe_counter!(
            METRIC_QUEUE_DROPPED_TOTAL,
            Unit::Count,
            "Total number of queued invalidations dropped due to queue overflow."
        );
        describe_histogram!(
            METRIC_CONSUME_MS,
            Unit::Milliseconds,
            "Queued invalidation consumption latency in milliseconds."
        );
    });
}

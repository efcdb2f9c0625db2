use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
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
        .map_err(InfraError::from)
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "memoserve_cache_hit_total",
            Unit::Count,
            "Total number of responses served from the cache store."
        );
        describe_counter!(
            "memoserve_cache_miss_total",
            Unit::Count,
            "Total number of lookups that fell through to a computation."
        );
        describe_counter!(
            "memoserve_cache_store_error_total",
            Unit::Count,
            "Total number of failed or timed out cache store calls, labelled by operation."
        );
        describe_counter!(
            "memoserve_cache_evict_total",
            Unit::Count,
            "Total number of in-memory store evictions due to capacity."
        );
        describe_counter!(
            "memoserve_coalesce_started_total",
            Unit::Count,
            "Total number of computations started by a leading request."
        );
        describe_counter!(
            "memoserve_coalesce_joined_total",
            Unit::Count,
            "Total number of requests that joined an in-flight computation."
        );
        describe_gauge!(
            "memoserve_coalesce_in_flight",
            Unit::Count,
            "Current number of keys with a computation in flight."
        );
        describe_histogram!(
            "memoserve_compute_ms",
            Unit::Milliseconds,
            "Computation latency in milliseconds."
        );
    });
}

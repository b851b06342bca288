use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::probe::{METRIC_PROBE_MS, METRIC_PROBE_TOTAL};
use crate::cache::{
    METRIC_CACHE_EVICT, METRIC_CACHE_EXPIRED, METRIC_CACHE_HIT, METRIC_CACHE_MISS,
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of authorization cache hits, by bucket tier."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of authorization cache misses, by bucket tier."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Total number of authorization cache evictions due to capacity."
        );
        describe_counter!(
            METRIC_CACHE_EXPIRED,
            Unit::Count,
            "Total number of authorization cache entries dropped after their TTL."
        );
        describe_counter!(
            METRIC_PROBE_TOTAL,
            Unit::Count,
            "Total number of upstream HEAD probes, by outcome."
        );
        describe_histogram!(
            METRIC_PROBE_MS,
            Unit::Milliseconds,
            "Upstream probe latency in milliseconds, redirects included."
        );
    });
}

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

    // stdout carries command output; logs go to stderr.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "storefront_cache_fetch_total",
            Unit::Count,
            "Provider fetches by resource and outcome (success, transient, permanent)."
        );
        describe_histogram!(
            "storefront_cache_fetch_ms",
            Unit::Milliseconds,
            "Provider fetch latency in milliseconds, including timeouts."
        );
        describe_counter!(
            "storefront_cache_debounce_suppressed_total",
            Unit::Count,
            "Initialize calls dropped by the per-context debounce window."
        );
        describe_counter!(
            "storefront_cache_singleflight_joined_total",
            Unit::Count,
            "Fetch requests satisfied by joining an in-flight fetch."
        );
        describe_counter!(
            "storefront_cache_invalidation_total",
            Unit::Count,
            "Write-through cache replacements."
        );
        describe_counter!(
            "storefront_cache_persist_error_total",
            Unit::Count,
            "Failed writes or deletes against the persistent key/value store."
        );
    });
}

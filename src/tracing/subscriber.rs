//! Tracing subscriber setup with layered architecture
//!
//! ```text
//! Registry
//!   ├── OpenTelemetry Layer (exports to OTLP, when enabled)
//!   ├── EnvFilter (RUST_LOG, falling back to the CLI level)
//!   └── Fmt Layer (text or JSON)
//! ```

use crate::config::TracingConfig;
use crate::tracing::init::{init_tracing, TracingError, TracingGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// `default_level` applies when `RUST_LOG` is not set. The returned guard
/// must be kept alive for the lifetime of the program.
pub fn init_subscriber(
    config: &TracingConfig,
    default_level: &str,
    json: bool,
) -> Result<TracingGuard, TracingError> {
    let guard = init_tracing(config)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let telemetry_layer = guard
        .tracer()
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
    });

    let subscriber = tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(env_filter)
        .with(json_layer)
        .with(text_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        TracingError::ProviderError(format!(
            "Failed to set global subscriber (may already be initialized): {}",
            e
        ))
    })?;

    Ok(guard)
}

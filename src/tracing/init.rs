//! OpenTelemetry tracer initialization and lifecycle management

use crate::config::TracingConfig;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_sdk::{runtime, Resource};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during tracing initialization
#[derive(Error, Debug)]
pub enum TracingError {
    #[error("Invalid OTLP endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to initialize OTLP exporter: {0}")]
    ExporterError(String),

    #[error("Failed to initialize tracer provider: {0}")]
    ProviderError(String),
}

/// RAII guard for tracing lifecycle management
///
/// Shuts down the global tracer provider when dropped, which flushes the
/// batch span processor.
pub struct TracingGuard {
    tracer: Option<Tracer>,
    active: bool,
}

impl TracingGuard {
    fn new(tracer: Tracer) -> Self {
        Self {
            tracer: Some(tracer),
            active: true,
        }
    }

    fn inactive() -> Self {
        Self {
            tracer: None,
            active: false,
        }
    }

    /// Check if tracing is active
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Tracer feeding the OTLP pipeline, if tracing is enabled
    pub fn tracer(&self) -> Option<Tracer> {
        self.tracer.clone()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if self.active {
            global::shutdown_tracer_provider();
        }
    }
}

/// Initialize the OTLP export pipeline.
///
/// Returns an inactive guard when `config.enabled` is false. Must be called
/// from within a tokio runtime.
pub fn init_tracing(config: &TracingConfig) -> Result<TracingGuard, TracingError> {
    if !config.enabled {
        return Ok(TracingGuard::inactive());
    }

    let endpoint = &config.otlp.endpoint;
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(TracingError::InvalidEndpoint(format!(
            "Endpoint must start with http:// or https://, got: {}",
            endpoint
        )));
    }

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(Duration::from_secs(config.otlp.timeout_seconds));

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TracingError::ExporterError(e.to_string()))?;

    Ok(TracingGuard::new(tracer))
}

/// Explicitly shutdown tracing and flush all pending spans
pub fn shutdown_tracing(mut guard: TracingGuard) -> Result<(), TracingError> {
    if guard.active {
        guard.active = false;
        guard.tracer = None;
        global::shutdown_tracer_provider();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OtlpConfig;

    #[test]
    fn test_disabled_tracing_is_inactive() {
        let config = TracingConfig {
            enabled: false,
            service_name: "test".into(),
            otlp: OtlpConfig::default(),
        };
        let guard = init_tracing(&config).unwrap();
        assert!(!guard.is_active());
        assert!(guard.tracer().is_none());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let config = TracingConfig {
            enabled: true,
            service_name: "test".into(),
            otlp: OtlpConfig {
                endpoint: "localhost:4317".into(),
                timeout_seconds: 1,
            },
        };
        assert!(matches!(
            init_tracing(&config),
            Err(TracingError::InvalidEndpoint(_))
        ));
    }
}

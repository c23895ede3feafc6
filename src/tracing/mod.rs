//! OpenTelemetry distributed tracing module
//!
//! Exports the `wcs.*` and `upload.*` spans to an OTLP collector. Only built
//! with the `tracing` cargo feature.
//!
//! # Example
//!
//! ```no_run
//! use wcs_uploadr::config::TracingConfig;
//! use wcs_uploadr::tracing::init_subscriber;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig {
//!     enabled: true,
//!     service_name: "wcs-uploadr".to_string(),
//! #   otlp: Default::default(),
//! };
//!
//! let _guard = init_subscriber(&config, "info", false)?;
//! // Guard will flush spans on drop
//! # Ok(())
//! # }
//! ```

pub mod init;
pub mod subscriber;

pub use init::{init_tracing, shutdown_tracing, TracingError, TracingGuard};
pub use subscriber::init_subscriber;

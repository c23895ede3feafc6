//! WCS Uploadr Library
//!
//! Resumable, concurrent chunked uploads to WCS-compatible object storage.
//!
//! # Features
//!
//! - **Resumable**: every acknowledged chunk is recorded, an interrupted
//!   upload continues where it stopped
//! - **Concurrent**: blocks upload in parallel over a bounded worker pool
//! - **Bounded Retry**: timeouts are retried a fixed number of times per block
//! - **Observable**: `tracing` spans per remote call and Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wcs_uploadr::config::Config;
//! use wcs_uploadr::upload::{FileResumeStore, ResumeUploader, UploadParams};
//! use wcs_uploadr::wcs::WcsClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let transport = Arc::new(WcsClient::new(&config.endpoint)?);
//!     let store = Arc::new(FileResumeStore::new(&config.record.dir, config.record.sync_writes));
//!
//!     let uploader = ResumeUploader::new(transport, store, &config.upload);
//!     uploader.upload("backup.tar", &UploadParams::new("ak:sig:policy")).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod metrics;
pub mod upload;
pub mod wcs;

#[cfg(feature = "tracing")]
pub mod tracing;

// Re-export commonly used types
pub use config::Config;
pub use upload::{ResumeUploader, UploadError, UploadParams};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

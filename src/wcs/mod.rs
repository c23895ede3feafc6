//! WCS upload protocol
//!
//! Three remote calls make up a resumable upload:
//!
//! | Operation | Request | Span Name |
//! |-----------|---------|-----------|
//! | open block | `POST /mkblk/{blockSize}/{blockIndex}` with the first chunk | `wcs.open_block` |
//! | append chunk | `POST /bput/{ctx}/{offsetInBlock}` | `wcs.append_chunk` |
//! | assemble | `POST /mkfile/{fileSize}[/{userParam}[/{userVars}]]` with the ctx list | `wcs.assemble` |
//!
//! The [`Transport`] trait performs exactly one call per invocation. It never
//! retries and keeps no state between calls; the upload engine decides what
//! to do with a failure.
//!
//! # Example
//!
//! ```no_run
//! use wcs_uploadr::config::EndpointConfig;
//! use wcs_uploadr::wcs::{SessionAuth, Transport, WcsClient};
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EndpointConfig {
//!     put_domain: "https://example.up0.v1.wcsapi.com".into(),
//!     connect_timeout_seconds: 10,
//!     request_timeout_seconds: 60,
//!     user_agent: None,
//! };
//! let client = WcsClient::new(&config)?;
//! let auth = SessionAuth::new("ak:sig:policy", "batch-1");
//!
//! let receipt = client
//!     .open_block(0, 5, Bytes::from_static(b"hello"), &auth)
//!     .await?;
//! println!("ctx: {}", receipt.ctx);
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::WcsClient;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response in time, or the connection broke mid-call
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The remote answered with a non-success status
    #[error("Remote rejected request: status {status}: {body}")]
    Remote { status: u16, body: String },

    /// Success status with a body that could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether repeating the identical call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Credential and batch id sent with every call of one session
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub credential: String,
    /// Sent as the `uploadBatch` header
    pub upload_batch: String,
}

impl SessionAuth {
    pub fn new(credential: impl Into<String>, upload_batch: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            upload_batch: upload_batch.into(),
        }
    }
}

/// Reply to `mkblk` and `bput`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    /// Context to continue the block with
    pub ctx: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub crc32: Option<u64>,
    /// Next offset inside the block, as reported by the remote
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub host: Option<String>,
}

/// Reply to `mkfile`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Everything else the remote returned
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Object metadata sent with `mkfile`
#[derive(Debug, Clone, Default)]
pub struct AssembleMetadata {
    /// Object key, sent URL-safe base64 encoded
    pub key: String,
    pub mime_type: Option<String>,
    pub user_param: Option<String>,
    /// Only used together with `user_param`
    pub encoded_user_vars: Option<String>,
}

/// One remote call per invocation, no retry
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a block and upload its first chunk
    async fn open_block(
        &self,
        block_index: u32,
        block_size: u64,
        first_chunk: Bytes,
        auth: &SessionAuth,
    ) -> Result<ChunkReceipt, TransportError>;

    /// Upload the chunk starting at `offset` inside the block of `context`
    async fn append_chunk(
        &self,
        context: &str,
        offset: u64,
        chunk: Bytes,
        auth: &SessionAuth,
    ) -> Result<ChunkReceipt, TransportError>;

    /// Join block contexts, in block order, into the final object
    async fn assemble(
        &self,
        file_size: u64,
        contexts: &[String],
        auth: &SessionAuth,
        metadata: &AssembleMetadata,
    ) -> Result<ObjectDescriptor, TransportError>;
}

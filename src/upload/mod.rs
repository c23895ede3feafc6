//! Resumable upload engine
//!
//! Splits a local file into blocks and chunks, uploads blocks concurrently,
//! records every acknowledged chunk so an interrupted upload can pick up
//! where it stopped, and finally assembles the remote object.
//!
//! # Flow
//!
//! 1. [`partition`] plans blocks and chunks for the file size
//! 2. [`ResumeUploader`] loads the last snapshot from the [`ResumeStore`]
//!    or starts a fresh [`UploadSession`]
//! 3. [`UploadScheduler`] runs one [`BlockWorker`] per unfinished block,
//!    at most `concurrency` at a time
//! 4. Once every block is acknowledged the contexts are sent to `mkfile`
//!    in block order and the record is removed

use crate::auth::AuthError;
use crate::wcs::TransportError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub mod controller;
pub mod partition;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::ResumeUploader;
pub use partition::{partition, BlockPlan};
pub use record::{
    EventLevel, FileResumeStore, MemoryResumeStore, RecordError, ResumeRecord, ResumeStore,
    SessionKey,
};
pub use retry::RetryPolicy;
pub use scheduler::{ProgressCallback, UploadProgress, UploadScheduler};
pub use session::{BlockState, UploadSession};
pub use worker::BlockWorker;

/// Remote call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenBlock,
    AppendChunk,
    Assemble,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::OpenBlock => "open-block",
            Stage::AppendChunk => "append-chunk",
            Stage::Assemble => "assemble",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block a failure belongs to, `-` for session-level calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef(pub Option<u32>);

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(index) => write!(f, "{}", index),
            None => f.write_str("-"),
        }
    }
}

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{stage} rejected (block {block}): status {status}: {body}")]
    Remote {
        stage: Stage,
        block: BlockRef,
        status: u16,
        body: String,
    },

    #[error("{stage} timed out {attempts} times (block {block})")]
    RetryExhausted {
        stage: Stage,
        block: BlockRef,
        attempts: u32,
    },

    #[error("{stage} returned an invalid response (block {block}): {message}")]
    InvalidResponse {
        stage: Stage,
        block: BlockRef,
        message: String,
    },

    #[error("Upload incomplete: {acked} of {expected} bytes acknowledged")]
    IncompleteUpload { acked: u64, expected: u64 },

    #[error("IO error on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resume record error: {0}")]
    Record(#[from] RecordError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid upload parameters: {0}")]
    InvalidParameters(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Block worker panicked: {0}")]
    WorkerPanicked(String),
}

impl UploadError {
    /// Map a non-retryable transport failure onto the upload taxonomy
    pub(crate) fn from_transport(stage: Stage, block: Option<u32>, err: TransportError) -> Self {
        let block = BlockRef(block);
        match err {
            TransportError::Remote { status, body } => UploadError::Remote {
                stage,
                block,
                status,
                body,
            },
            TransportError::Timeout(_) => UploadError::RetryExhausted {
                stage,
                block,
                attempts: 1,
            },
            TransportError::InvalidResponse(message)
            | TransportError::InvalidRequest(message) => UploadError::InvalidResponse {
                stage,
                block,
                message,
            },
        }
    }

    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UploadError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Stage the error was raised in, if it came from a remote call
    pub fn stage(&self) -> Option<Stage> {
        match self {
            UploadError::Remote { stage, .. }
            | UploadError::RetryExhausted { stage, .. }
            | UploadError::InvalidResponse { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Remote { .. } => "remote",
            UploadError::RetryExhausted { .. } => "retry_exhausted",
            UploadError::InvalidResponse { .. } => "invalid_response",
            UploadError::IncompleteUpload { .. } => "incomplete",
            UploadError::LocalIo { .. } => "local_io",
            UploadError::Record(_) => "record",
            UploadError::Auth(_) => "auth",
            UploadError::InvalidParameters(_) => "invalid_parameters",
            UploadError::Cancelled => "cancelled",
            UploadError::WorkerPanicked(_) => "panic",
        }
    }
}

/// Per-call upload parameters
#[derive(Debug, Clone, Default)]
pub struct UploadParams {
    /// Upload token for this session
    pub credential: String,
    /// Object key. Defaults to the file name.
    pub key: Option<String>,
    pub mime_type: Option<String>,
    /// Extra `mkfile` path segment, passed through verbatim
    pub user_param: Option<String>,
    /// Encoded user variables, only sent when `user_param` is set
    pub encoded_user_vars: Option<String>,
}

impl UploadParams {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            ..Default::default()
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn user_param(mut self, user_param: impl Into<String>) -> Self {
        self.user_param = Some(user_param.into());
        self
    }

    pub fn encoded_user_vars(mut self, vars: impl Into<String>) -> Self {
        self.encoded_user_vars = Some(vars.into());
        self
    }
}

//! Resumable upload controller
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wcs_uploadr::config::Config;
//! use wcs_uploadr::upload::{FileResumeStore, ResumeUploader, UploadParams};
//! use wcs_uploadr::wcs::WcsClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::with_put_domain("https://example.up0.v1.wcsapi.com");
//! let transport = Arc::new(WcsClient::new(&config.endpoint)?);
//! let store = Arc::new(FileResumeStore::new(&config.record.dir, config.record.sync_writes));
//!
//! let uploader = ResumeUploader::new(transport, store, &config.upload)
//!     .on_progress(|p| println!("{:.1}%", p.percent()));
//!
//! let params = UploadParams::new("ak:sig:policy").mime_type("video/mp4");
//! let object = uploader.upload("movie.mp4", &params).await?;
//! println!("hash: {:?}", object.hash);
//! # Ok(())
//! # }
//! ```

use super::record::{EventLevel, ResumeStore, SessionKey};
use super::retry::RetryPolicy;
use super::scheduler::{ProgressCallback, UploadProgress, UploadScheduler};
use super::session::UploadSession;
use super::{Stage, UploadError, UploadParams};
use crate::auth::validate_token;
use crate::config::UploadConfig;
use crate::metrics;
use crate::wcs::{AssembleMetadata, ObjectDescriptor, SessionAuth, Transport};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Uploads local files, resuming from persisted progress
pub struct ResumeUploader {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ResumeStore>,
    block_size: u64,
    chunk_size: u64,
    concurrency: usize,
    retry: RetryPolicy,
    progress: Option<ProgressCallback>,
}

impl ResumeUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ResumeStore>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            transport,
            store,
            block_size: config.block_size,
            chunk_size: config.chunk_size,
            concurrency: config.concurrency,
            retry: RetryPolicy::from_config(config),
            progress: None,
        }
    }

    /// Call `callback` after every persisted chunk
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Upload `path`, resuming a previous attempt if one was recorded
    pub async fn upload(
        &self,
        path: impl AsRef<Path>,
        params: &UploadParams,
    ) -> Result<ObjectDescriptor, UploadError> {
        self.upload_with_cancel(path, params, CancellationToken::new())
            .await
    }

    /// Like [`upload`](Self::upload), stopping between remote calls once
    /// `cancel` fires. Progress made so far stays recorded.
    pub async fn upload_with_cancel(
        &self,
        path: impl AsRef<Path>,
        params: &UploadParams,
        cancel: CancellationToken,
    ) -> Result<ObjectDescriptor, UploadError> {
        let path = path.as_ref();
        let start = Instant::now();

        let result = self.run(path, params, &cancel).await;

        match &result {
            Ok(_) => metrics::record_upload_success(start.elapsed().as_secs_f64()),
            Err(e) => metrics::record_upload_failure(e.kind()),
        }

        result
    }

    #[tracing::instrument(
        name = "upload",
        skip(self, path, params, cancel),
        fields(path = %path.display())
    )]
    async fn run(
        &self,
        path: &Path,
        params: &UploadParams,
        cancel: &CancellationToken,
    ) -> Result<ObjectDescriptor, UploadError> {
        validate_token(&params.credential)?;

        let file_size = file_size(path).await?;
        let key = SessionKey::derive(path, file_size);

        let mut session = self.open_session(&key, file_size, params)?;

        let scheduler = UploadScheduler::new(
            self.transport.clone(),
            self.store.clone(),
            self.retry,
            self.concurrency,
        )
        .with_progress(self.progress.clone());

        if let Err(e) = scheduler.run(&mut session, &key, path, cancel).await {
            self.store.event(&key, EventLevel::Error, &e.to_string());
            return Err(e);
        }

        let acked = session.bytes_acked();
        if acked != file_size {
            let err = UploadError::IncompleteUpload {
                acked,
                expected: file_size,
            };
            self.store.event(&key, EventLevel::Error, &err.to_string());
            return Err(err);
        }

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let descriptor = match self.assemble(path, &session, params).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.store.event(&key, EventLevel::Error, &e.to_string());
                return Err(e);
            }
        };

        self.store.clear(&key);

        tracing::info!(
            file_size,
            blocks = session.blocks.len(),
            hash = ?descriptor.hash,
            "Upload complete"
        );

        Ok(descriptor)
    }

    /// Resume the recorded session for `key` if it fits, otherwise start
    /// and persist a fresh one
    fn open_session(
        &self,
        key: &SessionKey,
        file_size: u64,
        params: &UploadParams,
    ) -> Result<UploadSession, UploadError> {
        match self.store.load(key)? {
            Some(mut session)
                if session.is_compatible(file_size, self.block_size, self.chunk_size) =>
            {
                session.credential = params.credential.clone();
                session.reset_retries(self.retry.max_attempts());

                let resumed = session.bytes_acked();
                metrics::record_resumed_bytes(resumed);
                tracing::info!(
                    session_id = %session.session_id,
                    resumed_bytes = resumed,
                    blocks_complete = session.blocks_complete(),
                    "Resuming upload"
                );
                self.store.event(
                    key,
                    EventLevel::Info,
                    &format!("resuming at {:.2}%", session.progress()),
                );

                Ok(session)
            }
            stale => {
                if stale.is_some() {
                    tracing::warn!(
                        key = %key,
                        "Recorded session does not match the file or block layout, starting over"
                    );
                    self.store.clear(key);
                }

                let session = UploadSession::new(
                    params.credential.clone(),
                    file_size,
                    self.block_size,
                    self.chunk_size,
                    self.retry.max_attempts(),
                )?;
                self.store.append(key, &session)?;
                self.store.event(
                    key,
                    EventLevel::Info,
                    &format!(
                        "upload started: {} bytes in {} blocks",
                        file_size,
                        session.blocks.len()
                    ),
                );

                tracing::info!(
                    session_id = %session.session_id,
                    file_size,
                    blocks = session.blocks.len(),
                    "Starting upload"
                );

                Ok(session)
            }
        }
    }

    async fn assemble(
        &self,
        path: &Path,
        session: &UploadSession,
        params: &UploadParams,
    ) -> Result<ObjectDescriptor, UploadError> {
        let contexts = session.contexts()?;
        let auth = SessionAuth::new(session.credential.clone(), session.session_id.clone());
        let metadata = AssembleMetadata {
            key: params.key.clone().unwrap_or_else(|| default_key(path)),
            mime_type: params.mime_type.clone(),
            user_param: params.user_param.clone(),
            encoded_user_vars: params.encoded_user_vars.clone(),
        };

        let transport: &dyn Transport = self.transport.as_ref();
        let contexts = contexts.as_slice();
        let auth = &auth;
        let metadata = &metadata;
        let file_size = session.file_size;
        let mut budget = self.retry.max_attempts();

        self.retry
            .run(&mut budget, Stage::Assemble, None, move || {
                transport.assemble(file_size, contexts, auth, metadata)
            })
            .await
    }

    /// Recorded progress for `path`, if an unfinished upload exists
    pub async fn status(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<UploadProgress>, UploadError> {
        let path = path.as_ref();
        let file_size = file_size(path).await?;
        let key = SessionKey::derive(path, file_size);

        Ok(self
            .store
            .load(&key)?
            .filter(|session| session.is_compatible(file_size, self.block_size, self.chunk_size))
            .map(|session| UploadProgress::of(&session)))
    }

    /// Drop recorded progress for `path`
    pub async fn forget(&self, path: impl AsRef<Path>) -> Result<(), UploadError> {
        let path = path.as_ref();
        let file_size = file_size(path).await?;
        self.store.clear(&SessionKey::derive(path, file_size));
        Ok(())
    }
}

async fn file_size(path: &Path) -> Result<u64, UploadError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| UploadError::local_io(path, e))?;

    if !metadata.is_file() {
        return Err(UploadError::InvalidParameters(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    Ok(metadata.len())
}

fn default_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

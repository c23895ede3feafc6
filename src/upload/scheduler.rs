//! Block scheduling
//!
//! Unfinished blocks are handed to [`BlockWorker`]s, at most `concurrency`
//! at a time. Workers report every acknowledged chunk over a channel to a
//! single aggregation loop, which is the only code that touches the session
//! and the resume store. The first failure stops dispatch; workers already
//! running finish their block.

use super::record::{EventLevel, ResumeStore, SessionKey};
use super::retry::RetryPolicy;
use super::session::{BlockState, UploadSession};
use super::worker::{BlockEvent, BlockWorker, WorkerContext};
use super::UploadError;
use crate::metrics;
use crate::wcs::{SessionAuth, Transport};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_acked: u64,
    pub file_size: u64,
    pub blocks_complete: usize,
    pub blocks_total: usize,
}

impl UploadProgress {
    pub fn of(session: &UploadSession) -> Self {
        Self {
            bytes_acked: session.bytes_acked(),
            file_size: session.file_size,
            blocks_complete: session.blocks_complete(),
            blocks_total: session.blocks.len(),
        }
    }

    /// Progress in percent
    pub fn percent(&self) -> f64 {
        if self.file_size == 0 {
            return if self.blocks_complete == self.blocks_total {
                100.0
            } else {
                0.0
            };
        }
        self.bytes_acked as f64 / self.file_size as f64 * 100.0
    }
}

/// Called after every persisted snapshot
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

/// Runs block workers for one session
pub struct UploadScheduler {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ResumeStore>,
    retry: RetryPolicy,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl UploadScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ResumeStore>,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            transport,
            store,
            retry,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Upload every unfinished block of `session` from `source`.
    ///
    /// Returns once all blocks are complete or the first error after
    /// in-flight workers have stopped. `session` reflects every persisted
    /// snapshot either way.
    pub async fn run(
        &self,
        session: &mut UploadSession,
        key: &SessionKey,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let pending: Vec<_> = session
            .blocks
            .iter()
            .filter(|block| !block.complete)
            .cloned()
            .collect();

        let skipped = session.blocks.len() - pending.len();
        for _ in 0..skipped {
            metrics::record_block("skipped");
        }

        if pending.is_empty() {
            return Ok(());
        }

        tracing::info!(
            pending = pending.len(),
            skipped,
            concurrency = self.concurrency,
            "Dispatching blocks"
        );

        let context = Arc::new(WorkerContext {
            transport: self.transport.clone(),
            source: source.to_path_buf(),
            block_size: session.block_size,
            chunk_size: session.chunk_size,
            auth: SessionAuth::new(session.credential.clone(), session.session_id.clone()),
            retry: self.retry,
        });

        let halt = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.concurrency);

        let dispatch = self.dispatch(pending, context, tx, halt.clone(), cancel.clone());
        tokio::pin!(dispatch);

        let mut outcome = None;
        loop {
            tokio::select! {
                result = &mut dispatch, if outcome.is_none() => outcome = Some(result),
                event = rx.recv() => match event {
                    Some(event) => self.apply(session, key, event, &halt),
                    None => break,
                },
            }
        }

        match outcome {
            Some(result) => result,
            None => dispatch.await,
        }
    }

    /// Record one snapshot and release the worker that sent it
    fn apply(
        &self,
        session: &mut UploadSession,
        key: &SessionKey,
        event: BlockEvent,
        halt: &CancellationToken,
    ) {
        let BlockEvent { state, ack } = event;
        let index = state.block_index as usize;

        let Some(slot) = session.blocks.get_mut(index) else {
            let _ = ack.send(Err(UploadError::InvalidParameters(format!(
                "block {} is not part of this session",
                index
            ))));
            halt.cancel();
            return;
        };

        metrics::record_bytes_acked(state.bytes_acked.saturating_sub(slot.bytes_acked));
        let completed = state.complete;
        *slot = state;

        let result = self.store.append(key, session).map_err(UploadError::from);

        match result {
            Ok(()) => {
                if completed {
                    self.store
                        .event(key, EventLevel::Info, &format!("block {} complete", index));
                }
                if let Some(ref progress) = self.progress {
                    progress(&UploadProgress::of(session));
                }
            }
            Err(ref e) => {
                tracing::error!(error = %e, block_index = index, "Failed to persist progress");
                halt.cancel();
            }
        }

        let _ = ack.send(result);
    }

    async fn dispatch(
        &self,
        pending: Vec<BlockState>,
        context: Arc<WorkerContext>,
        tx: mpsc::Sender<BlockEvent>,
        halt: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<(), UploadError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let total = pending.len();
        let mut dispatched = 0usize;

        for state in pending {
            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = BlockWorker::new(context.clone(), state, tx.clone(), cancel.clone());
            let halt = halt.clone();

            workers.spawn(async move {
                let _permit = permit;
                let result = worker.run().await;
                if result.is_err() {
                    halt.cancel();
                }
                result
            });
            dispatched += 1;
        }

        drop(tx);

        let mut first_error = None;
        let mut cancelled = dispatched < total;

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(UploadError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    halt.cancel();
                    first_error.get_or_insert(UploadError::WorkerPanicked(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if cancelled => Err(UploadError::Cancelled),
            None => Ok(()),
        }
    }
}

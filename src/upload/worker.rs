//! Block worker
//!
//! Uploads the chunks of one block in order. The first chunk travels with
//! the open-block call; every later chunk is appended to the context the
//! previous call returned. After each acknowledged chunk the worker hands a
//! snapshot of its block to the aggregator and waits until it is persisted.

use super::retry::RetryPolicy;
use super::session::BlockState;
use super::{Stage, UploadError};
use crate::metrics;
use crate::wcs::{SessionAuth, Transport};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Everything workers of one session share
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub source: PathBuf,
    pub block_size: u64,
    pub chunk_size: u64,
    pub auth: SessionAuth,
    pub retry: RetryPolicy,
}

/// Snapshot of a block after an acknowledged chunk
pub(crate) struct BlockEvent {
    pub state: BlockState,
    /// Answered once the snapshot is durable
    pub ack: oneshot::Sender<Result<(), UploadError>>,
}

/// Uploads one block
pub struct BlockWorker {
    context: Arc<WorkerContext>,
    state: BlockState,
    events: mpsc::Sender<BlockEvent>,
    cancel: CancellationToken,
}

impl BlockWorker {
    pub(crate) fn new(
        context: Arc<WorkerContext>,
        state: BlockState,
        events: mpsc::Sender<BlockEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            state,
            events,
            cancel,
        }
    }

    /// Upload the remaining chunks and return the completed block
    #[tracing::instrument(
        name = "upload.block",
        skip(self),
        fields(block_index = self.state.block_index, resumed_chunks = self.state.chunks_acked)
    )]
    pub async fn run(self) -> Result<BlockState, UploadError> {
        let result = self.upload().await;

        match &result {
            Ok(_) => metrics::record_block("complete"),
            Err(UploadError::Cancelled) => {}
            Err(e) => {
                metrics::record_block("failed");
                tracing::warn!(error = %e, "Block failed");
            }
        }

        result
    }

    async fn upload(self) -> Result<BlockState, UploadError> {
        let Self {
            context,
            mut state,
            events,
            cancel,
        } = self;

        if state.complete {
            return Ok(state);
        }

        let mut file = File::open(&context.source)
            .await
            .map_err(|e| UploadError::local_io(&context.source, e))?;

        let transport: &dyn Transport = context.transport.as_ref();
        let auth = &context.auth;
        let plan = state.plan();
        let block_index = state.block_index;
        let mut budget = state.retries_remaining;

        // A context persisted by an earlier run may have expired remotely
        let mut may_restart = state.chunks_acked > 0;

        while !state.complete {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let chunk_index = state.chunks_acked;
            let len = plan.chunk_len(chunk_index, context.chunk_size);
            let offset = plan.file_offset(chunk_index, context.block_size, context.chunk_size);
            let chunk = read_chunk(&mut file, &context.source, offset, len).await?;

            let receipt = match state.context.clone() {
                Some(ctx) if chunk_index > 0 => {
                    let ctx = ctx.as_str();
                    let offset_in_block = u64::from(chunk_index) * context.chunk_size;
                    let result = context
                        .retry
                        .run(&mut budget, Stage::AppendChunk, Some(block_index), move || {
                            transport.append_chunk(ctx, offset_in_block, chunk.clone(), auth)
                        })
                        .await;

                    match result {
                        Err(UploadError::Remote { status, .. }) if may_restart => {
                            tracing::warn!(
                                block_index,
                                status,
                                "Persisted context rejected, restarting block"
                            );
                            metrics::record_block("restarted");
                            may_restart = false;
                            state.restart();
                            continue;
                        }
                        other => other?,
                    }
                }
                _ => {
                    if chunk_index > 0 {
                        // Progress without a context cannot be continued
                        state.restart();
                        continue;
                    }
                    let block_byte_size = plan.block_byte_size;
                    context
                        .retry
                        .run(&mut budget, Stage::OpenBlock, Some(block_index), move || {
                            transport.open_block(block_index, block_byte_size, chunk.clone(), auth)
                        })
                        .await?
                }
            };

            may_restart = false;
            state.ack_chunk(len, receipt.ctx);
            state.retries_remaining = budget;

            persist(&events, &state).await?;

            tracing::debug!(
                block_index,
                chunk_index,
                bytes_acked = state.bytes_acked,
                "Chunk acknowledged"
            );
        }

        Ok(state)
    }
}

/// Hand a snapshot to the aggregator and wait until it is persisted
async fn persist(events: &mpsc::Sender<BlockEvent>, state: &BlockState) -> Result<(), UploadError> {
    let (ack, persisted) = oneshot::channel();

    events
        .send(BlockEvent {
            state: state.clone(),
            ack,
        })
        .await
        .map_err(|_| UploadError::Cancelled)?;

    persisted.await.map_err(|_| UploadError::Cancelled)?
}

async fn read_chunk(
    file: &mut File,
    path: &Path,
    offset: u64,
    len: u64,
) -> Result<Bytes, UploadError> {
    let mut buf = vec![0u8; len as usize];

    if len > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| UploadError::local_io(path, e))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| UploadError::local_io(path, e))?;
    }

    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::partition::partition;
    use crate::upload::testing::{ctx, rejected, timeout, Call, FakeTransport, Op};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Harness {
        transport: Arc<FakeTransport>,
        context: Arc<WorkerContext>,
        _file: NamedTempFile,
    }

    fn harness(content: &[u8], block_size: u64, chunk_size: u64) -> Harness {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();

        let transport = Arc::new(FakeTransport::new());
        let context = Arc::new(WorkerContext {
            transport: transport.clone(),
            source: file.path().to_path_buf(),
            block_size,
            chunk_size,
            auth: SessionAuth::new("token", "batch"),
            retry: RetryPolicy::new(3, Duration::ZERO),
        });

        Harness {
            transport,
            context,
            _file: file,
        }
    }

    fn block(harness: &Harness, file_size: u64, index: usize) -> BlockState {
        let plan = partition(file_size, harness.context.block_size, harness.context.chunk_size)
            .unwrap();
        BlockState::new(plan[index], 3)
    }

    /// Run a worker while acknowledging every snapshot
    async fn run(
        harness: &Harness,
        state: BlockState,
        cancel: CancellationToken,
    ) -> (Result<BlockState, UploadError>, Vec<BlockState>) {
        let (tx, mut rx) = mpsc::channel(1);
        let worker = BlockWorker::new(harness.context.clone(), state, tx, cancel);

        let collector = tokio::spawn(async move {
            let mut snapshots = Vec::new();
            while let Some(event) = rx.recv().await {
                snapshots.push(event.state);
                let _ = event.ack.send(Ok(()));
            }
            snapshots
        });

        let result = worker.run().await;
        let snapshots = collector.await.unwrap();
        (result, snapshots)
    }

    #[tokio::test]
    async fn test_first_chunk_rides_with_open_block() {
        let h = harness(b"0123456789", 8, 4);
        let state = block(&h, 10, 0);

        let (result, snapshots) = run(&h, state, CancellationToken::new()).await;
        let done = result.unwrap();

        assert!(done.complete);
        assert_eq!(done.context.as_deref(), Some(ctx(0, 8).as_str()));
        assert_eq!(snapshots.len(), 2);
        assert_eq!(
            h.transport.calls(),
            vec![
                Call::Open {
                    block_index: 0,
                    block_size: 8,
                    len: 4,
                    credential: "token".into()
                },
                Call::Append {
                    context: ctx(0, 4),
                    offset: 4,
                    len: 4
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reads_chunk_at_block_offset() {
        let h = harness(b"0123456789", 8, 4);
        let state = block(&h, 10, 1);

        let (result, _) = run(&h, state, CancellationToken::new()).await;
        assert_eq!(result.unwrap().bytes_acked, 2);
        assert_eq!(
            h.transport.calls(),
            vec![Call::Open {
                block_index: 1,
                block_size: 2,
                len: 2,
                credential: "token".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_resumes_at_next_chunk() {
        let h = harness(&[7u8; 12], 12, 4);
        let mut state = block(&h, 12, 0);
        state.ack_chunk(4, ctx(0, 4));
        state.ack_chunk(4, ctx(0, 8));

        let (result, snapshots) = run(&h, state, CancellationToken::new()).await;
        assert!(result.unwrap().complete);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(h.transport.count(Op::Open), 0);
        assert_eq!(
            h.transport.calls(),
            vec![Call::Append {
                context: ctx(0, 8),
                offset: 8,
                len: 4
            }]
        );
    }

    #[tokio::test]
    async fn test_complete_block_makes_no_calls() {
        let h = harness(b"abcd", 4, 4);
        let mut state = block(&h, 4, 0);
        state.ack_chunk(4, ctx(0, 4));

        let (result, snapshots) = run(&h, state, CancellationToken::new()).await;
        assert!(result.unwrap().complete);
        assert!(snapshots.is_empty());
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_retry_same_chunk() {
        let h = harness(b"0123456789", 8, 4);
        h.transport.fail(Op::Append, Some(0), vec![timeout(), timeout()]);

        let (result, _) = run(&h, block(&h, 10, 0), CancellationToken::new()).await;
        let done = result.unwrap();

        assert_eq!(done.retries_remaining, 3);
        let appends: Vec<_> = h
            .transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Append { .. }))
            .collect();
        assert_eq!(appends.len(), 3);
        assert!(appends.iter().all(|call| *call
            == Call::Append {
                context: ctx(0, 4),
                offset: 4,
                len: 4
            }));
    }

    #[tokio::test]
    async fn test_budget_resets_after_each_success() {
        let h = harness(&[1u8; 12], 12, 4);
        // Two timeouts before every call succeeds, never three in a row
        h.transport.fail(Op::Open, Some(0), vec![timeout(), timeout()]);
        h.transport.fail(Op::Append, Some(0), vec![timeout(), timeout()]);
        h.transport.pass(Op::Append, Some(0), 1);
        h.transport.fail(Op::Append, Some(0), vec![timeout(), timeout()]);

        let (result, _) = run(&h, block(&h, 12, 0), CancellationToken::new()).await;
        assert!(result.unwrap().complete);
        assert_eq!(h.transport.count(Op::Open), 3);
        assert_eq!(h.transport.count(Op::Append), 6);
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_block() {
        let h = harness(b"0123", 4, 4);
        h.transport.fail(Op::Open, Some(0), vec![timeout(), timeout(), timeout()]);

        let (result, snapshots) = run(&h, block(&h, 4, 0), CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(UploadError::RetryExhausted {
                stage: Stage::OpenBlock,
                attempts: 3,
                ..
            })
        ));
        assert!(snapshots.is_empty());
        assert_eq!(h.transport.count(Op::Open), 3);
    }

    #[tokio::test]
    async fn test_rejected_resumed_context_restarts_block_once() {
        let h = harness(&[3u8; 12], 12, 4);
        let mut state = block(&h, 12, 0);
        state.ack_chunk(4, ctx(0, 4));
        h.transport.fail(Op::Append, Some(0), vec![rejected(701)]);

        let (result, _) = run(&h, state, CancellationToken::new()).await;
        let done = result.unwrap();

        assert!(done.complete);
        assert_eq!(done.bytes_acked, 12);
        assert_eq!(h.transport.count(Op::Open), 1);
        assert_eq!(h.transport.count(Op::Append), 3);
    }

    #[tokio::test]
    async fn test_rejection_on_fresh_block_is_fatal() {
        let h = harness(&[3u8; 8], 8, 4);
        h.transport.fail(Op::Append, Some(0), vec![rejected(400)]);

        let (result, snapshots) = run(&h, block(&h, 8, 0), CancellationToken::new()).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Remote {
                stage: Stage::AppendChunk,
                status: 400,
                ..
            }
        ));
        assert!(err.to_string().contains("block 0"));
        assert_eq!(snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let h = harness(b"abcd", 4, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, _) = run(&h, block(&h, 4, 0), cancel).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_block_opens_with_empty_chunk() {
        let h = harness(b"", 4, 4);
        let (result, snapshots) = run(&h, block(&h, 0, 0), CancellationToken::new()).await;

        assert!(result.unwrap().complete);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            h.transport.calls(),
            vec![Call::Open {
                block_index: 0,
                block_size: 0,
                len: 0,
                credential: "token".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_persist_failure_stops_worker() {
        let h = harness(&[1u8; 8], 8, 4);
        let (tx, mut rx) = mpsc::channel(1);
        let worker = BlockWorker::new(
            h.context.clone(),
            block(&h, 8, 0),
            tx,
            CancellationToken::new(),
        );

        tokio::spawn(async move {
            if let Some(event) = rx.recv().await {
                let _ = event.ack.send(Err(UploadError::InvalidParameters("disk full".into())));
            }
        });

        let result = worker.run().await;
        assert!(matches!(result, Err(UploadError::InvalidParameters(_))));
        assert_eq!(h.transport.count(Op::Append), 0);
    }
}

//! Scripted transport for unit tests
//!
//! Contexts are deterministic: a block's context after `n` acknowledged
//! bytes is `b{index}@{n}`, so tests can tell exactly which calls happened.

use crate::wcs::{
    AssembleMetadata, ChunkReceipt, ObjectDescriptor, SessionAuth, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Open,
    Append,
    Assemble,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Open {
        block_index: u32,
        block_size: u64,
        len: usize,
        credential: String,
    },
    Append {
        context: String,
        offset: u64,
        len: usize,
    },
    Assemble {
        file_size: u64,
        contexts: Vec<String>,
        key: String,
    },
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<(Op, Option<u32>), VecDeque<Option<TransportError>>>>,
    delay: Option<Duration>,
    block_delays: Mutex<HashMap<u32, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub(crate) fn ctx(block_index: u32, end: u64) -> String {
    format!("b{}@{}", block_index, end)
}

fn block_of(context: &str) -> Option<u32> {
    context
        .strip_prefix('b')
        .and_then(|rest| rest.split('@').next())
        .and_then(|index| index.parse().ok())
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Hold every call on `block` for an extra `delay`
    pub(crate) fn delay_block(&self, block: u32, delay: Duration) {
        self.block_delays.lock().insert(block, delay);
    }

    /// Fail the next calls of `op` on `block` with `errors`, in order
    pub(crate) fn fail(&self, op: Op, block: Option<u32>, errors: Vec<TransportError>) {
        self.failures
            .lock()
            .entry((op, block))
            .or_default()
            .extend(errors.into_iter().map(Some));
    }

    /// Let `count` scripted calls of `op` on `block` succeed
    pub(crate) fn pass(&self, op: Op, block: Option<u32>, count: usize) {
        self.failures
            .lock()
            .entry((op, block))
            .or_default()
            .extend(std::iter::repeat(None).take(count));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, op: Op) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| {
                matches!(
                    (op, call),
                    (Op::Open, Call::Open { .. })
                        | (Op::Append, Call::Append { .. })
                        | (Op::Assemble, Call::Assemble { .. })
                )
            })
            .count()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Op, block: Option<u32>, call: Call) -> Result<(), TransportError> {
        self.calls.lock().push(call);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let block_delay = block.and_then(|index| self.block_delays.lock().get(&index).copied());
        if let Some(delay) = block_delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .failures
            .lock()
            .get_mut(&(op, block))
            .and_then(VecDeque::pop_front)
            .flatten();

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_block(
        &self,
        block_index: u32,
        block_size: u64,
        first_chunk: Bytes,
        auth: &SessionAuth,
    ) -> Result<ChunkReceipt, TransportError> {
        let call = Call::Open {
            block_index,
            block_size,
            len: first_chunk.len(),
            credential: auth.credential.clone(),
        };
        self.enter(Op::Open, Some(block_index), call).await?;

        Ok(ChunkReceipt {
            ctx: ctx(block_index, first_chunk.len() as u64),
            checksum: None,
            crc32: None,
            offset: Some(first_chunk.len() as u64),
            host: None,
        })
    }

    async fn append_chunk(
        &self,
        context: &str,
        offset: u64,
        chunk: Bytes,
        _auth: &SessionAuth,
    ) -> Result<ChunkReceipt, TransportError> {
        let block = block_of(context);
        let call = Call::Append {
            context: context.to_string(),
            offset,
            len: chunk.len(),
        };
        self.enter(Op::Append, block, call).await?;

        let end = offset + chunk.len() as u64;
        Ok(ChunkReceipt {
            ctx: ctx(block.unwrap_or(u32::MAX), end),
            checksum: None,
            crc32: None,
            offset: Some(end),
            host: None,
        })
    }

    async fn assemble(
        &self,
        file_size: u64,
        contexts: &[String],
        _auth: &SessionAuth,
        metadata: &AssembleMetadata,
    ) -> Result<ObjectDescriptor, TransportError> {
        let call = Call::Assemble {
            file_size,
            contexts: contexts.to_vec(),
            key: metadata.key.clone(),
        };
        self.enter(Op::Assemble, None, call).await?;

        Ok(ObjectDescriptor {
            hash: Some(format!("hash-{}", file_size)),
            key: Some(metadata.key.clone()),
            extra: Default::default(),
        })
    }
}

pub(crate) fn timeout() -> TransportError {
    TransportError::Timeout("no response".into())
}

pub(crate) fn rejected(status: u16) -> TransportError {
    TransportError::Remote {
        status,
        body: "rejected".into(),
    }
}

//! Upload session state
//!
//! [`UploadSession`] is what gets written to the resume log after every
//! acknowledged chunk. Blocks live in a vector indexed by block index, so a
//! worker result is written straight back into its slot.

use super::partition::{partition, BlockPlan};
use super::UploadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub block_index: u32,
    pub block_byte_size: u64,
    pub chunk_count: u32,
    pub chunks_acked: u32,
    pub bytes_acked: u64,
    /// Context returned by the last acknowledged call for this block
    pub context: Option<String>,
    pub complete: bool,
    pub retries_remaining: u32,
}

impl BlockState {
    pub fn new(plan: BlockPlan, max_attempts: u32) -> Self {
        Self {
            block_index: plan.block_index,
            block_byte_size: plan.block_byte_size,
            chunk_count: plan.chunk_count,
            chunks_acked: 0,
            bytes_acked: 0,
            context: None,
            complete: false,
            retries_remaining: max_attempts,
        }
    }

    pub fn plan(&self) -> BlockPlan {
        BlockPlan {
            block_index: self.block_index,
            block_byte_size: self.block_byte_size,
            chunk_count: self.chunk_count,
        }
    }

    /// Record an acknowledged chunk of `len` bytes
    pub fn ack_chunk(&mut self, len: u64, context: String) {
        self.chunks_acked += 1;
        self.bytes_acked += len;
        self.context = Some(context);
        self.complete =
            self.chunks_acked == self.chunk_count && self.bytes_acked == self.block_byte_size;
    }

    /// Drop all progress so the block starts over with a fresh open-block
    pub fn restart(&mut self) {
        self.chunks_acked = 0;
        self.bytes_acked = 0;
        self.context = None;
        self.complete = false;
    }

    /// A block may resume only from a state it could have reached itself
    fn is_consistent(&self, plan: &BlockPlan) -> bool {
        if self.plan() != *plan || self.chunks_acked > self.chunk_count {
            return false;
        }
        if self.bytes_acked > self.block_byte_size {
            return false;
        }
        if self.chunks_acked > 0 && self.context.is_none() {
            return false;
        }
        let finished =
            self.chunks_acked == self.chunk_count && self.bytes_acked == self.block_byte_size;
        self.complete == finished
    }
}

/// One resumable transfer of one local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub credential: String,
    pub file_size: u64,
    pub block_size: u64,
    pub chunk_size: u64,
    pub created_at: DateTime<Utc>,
    pub blocks: Vec<BlockState>,
}

impl UploadSession {
    /// Start a fresh session with every block pending
    pub fn new(
        credential: impl Into<String>,
        file_size: u64,
        block_size: u64,
        chunk_size: u64,
        max_attempts: u32,
    ) -> Result<Self, UploadError> {
        let blocks = partition(file_size, block_size, chunk_size)?
            .into_iter()
            .map(|plan| BlockState::new(plan, max_attempts))
            .collect();

        Ok(Self {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            credential: credential.into(),
            file_size,
            block_size,
            chunk_size,
            created_at: Utc::now(),
            blocks,
        })
    }

    /// Whether a persisted session can continue an upload with these
    /// parameters. Any mismatch means the old progress is unusable.
    pub fn is_compatible(&self, file_size: u64, block_size: u64, chunk_size: u64) -> bool {
        if self.file_size != file_size
            || self.block_size != block_size
            || self.chunk_size != chunk_size
        {
            return false;
        }

        let Ok(plan) = partition(file_size, block_size, chunk_size) else {
            return false;
        };

        plan.len() == self.blocks.len()
            && plan
                .iter()
                .zip(&self.blocks)
                .all(|(plan, state)| state.is_consistent(plan))
    }

    pub fn bytes_acked(&self) -> u64 {
        self.blocks.iter().map(|b| b.bytes_acked).sum()
    }

    pub fn blocks_complete(&self) -> usize {
        self.blocks.iter().filter(|b| b.complete).count()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.complete)
    }

    /// Upload progress in percent
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return if self.is_complete() { 100.0 } else { 0.0 };
        }
        self.bytes_acked() as f64 / self.file_size as f64 * 100.0
    }

    /// Restore every block's retry budget
    pub fn reset_retries(&mut self, max_attempts: u32) {
        for block in &mut self.blocks {
            block.retries_remaining = max_attempts;
        }
    }

    /// Final contexts in block order, as `mkfile` expects them
    pub fn contexts(&self) -> Result<Vec<String>, UploadError> {
        self.blocks
            .iter()
            .map(|block| match (&block.context, block.complete) {
                (Some(ctx), true) => Ok(ctx.clone()),
                _ => Err(UploadError::IncompleteUpload {
                    acked: self.bytes_acked(),
                    expected: self.file_size,
                }),
            })
            .collect()
    }
}

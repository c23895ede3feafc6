//! Block and chunk planning
//!
//! A file is cut into blocks of `block_size` bytes (the last one may be
//! shorter) and every block into chunks of `chunk_size` bytes. Each block
//! gets its own remote context; chunks are the payload of a single call.

use super::UploadError;

/// One planned block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub block_index: u32,
    pub block_byte_size: u64,
    pub chunk_count: u32,
}

impl BlockPlan {
    /// Size of chunk `chunk_index` inside this block
    pub fn chunk_len(&self, chunk_index: u32, chunk_size: u64) -> u64 {
        let start = u64::from(chunk_index) * chunk_size;
        self.block_byte_size.saturating_sub(start).min(chunk_size)
    }

    /// Absolute file offset of chunk `chunk_index`
    pub fn file_offset(&self, chunk_index: u32, block_size: u64, chunk_size: u64) -> u64 {
        u64::from(self.block_index) * block_size + u64::from(chunk_index) * chunk_size
    }
}

/// Plan blocks for a file of `file_size` bytes.
///
/// An empty file still yields one zero-sized block with one chunk, because
/// the remote side needs at least one context to assemble an object.
pub fn partition(
    file_size: u64,
    block_size: u64,
    chunk_size: u64,
) -> Result<Vec<BlockPlan>, UploadError> {
    if block_size == 0 || chunk_size == 0 {
        return Err(UploadError::InvalidParameters(format!(
            "block_size ({}) and chunk_size ({}) must be positive",
            block_size, chunk_size
        )));
    }

    let block_count = file_size.div_ceil(block_size).max(1);
    if block_count > u64::from(u32::MAX) {
        return Err(UploadError::InvalidParameters(format!(
            "{} blocks exceed the addressable block count",
            block_count
        )));
    }

    // The first block is the largest
    let max_chunks = file_size.min(block_size).div_ceil(chunk_size);
    if max_chunks > u64::from(u32::MAX) {
        return Err(UploadError::InvalidParameters(format!(
            "{} chunks per block exceed the addressable chunk count",
            max_chunks
        )));
    }

    let blocks = (0..block_count)
        .map(|index| {
            let block_byte_size = (file_size - index * block_size).min(block_size);
            let chunk_count = block_byte_size.div_ceil(chunk_size).max(1);
            BlockPlan {
                block_index: index as u32,
                block_byte_size,
                chunk_count: chunk_count as u32,
            }
        })
        .collect();

    Ok(blocks)
}

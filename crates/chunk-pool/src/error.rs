//! Error types for chunk allocation.

use thiserror::Error;
use utils::AllocatorError;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPoolError {
    #[error("mempool has no free chunks left")]
    PoolExhausted,

    #[error("invalid chunk count {0}")]
    InvalidChunkCount(u32),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("mempool memory is not mapped in this process")]
    NotMapped,

    #[error("failed to carve mempool out of its arena: {0}")]
    Allocator(#[from] AllocatorError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSettingsError {
    #[error("user payload alignment {0} is not a power of two")]
    AlignmentNotPowerOfTwo(u32),

    #[error("a payload of {payload_size} bytes aligned to {alignment} does not fit into a chunk")]
    RequiredChunkSizeExceedsMaxChunkSize { payload_size: u32, alignment: u32 },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryManagerError {
    #[error("the mempool configuration is empty")]
    NoMempoolsAvailable,

    #[error("{0} mempools configured, at most {max} are supported", max = crate::MAX_NUMBER_OF_MEMPOOLS)]
    TooManyMempools(usize),

    #[error("mempools must be configured with strictly increasing payload sizes")]
    MempoolConfigMustBeOrderedByIncreasingSize,

    #[error("no mempool holds chunks of {required} bytes")]
    NoMempoolForRequestedChunkSize { required: u32 },

    #[error(transparent)]
    MemPool(#[from] MemPoolError),

    #[error(transparent)]
    ChunkSettings(#[from] ChunkSettingsError),
}

//! Zero-copy chunk memory management.
//!
//! Payload chunks are drawn from fixed block-size [`MemPool`]s, described by a
//! [`ChunkHeader`] at their start and tracked by a [`ChunkManagement`] record
//! living in a dedicated management pool. A [`SharedChunk`] is the
//! reference-counted handle over such a record; once the last handle is gone,
//! both blocks return to their pools. [`ChunkRef`] is the form of a handle that
//! can be written into shared memory and picked up by another process.

pub mod chunk_header;
pub mod chunk_management;
pub mod config;
pub mod error;
mod free_list;
pub mod mem_pool;
pub mod memory_manager;
pub mod shared_chunk;

pub use chunk_header::ChunkHeader;
pub use chunk_header::ChunkSettings;
pub use chunk_management::ChunkManagement;
pub use config::MemPoolConfig;
pub use config::MemPoolEntry;
pub use config::CHUNK_MEMORY_ALIGNMENT;
pub use config::DEFAULT_USER_PAYLOAD_ALIGNMENT;
pub use config::MAX_NUMBER_OF_MEMPOOLS;
pub use error::ChunkSettingsError;
pub use error::MemPoolError;
pub use error::MemoryManagerError;
pub use mem_pool::MemPool;
pub use mem_pool::MemPoolInfo;
pub use memory_manager::MemoryManager;
pub use shared_chunk::ChunkRef;
pub use shared_chunk::SharedChunk;

//! Mempool layout configuration.

use std::mem::size_of;
use std::sync::atomic::AtomicU32;

use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::info;
use utils::allocator::align_up;

use crate::chunk_header::ChunkSettings;
use crate::chunk_management::ChunkManagement;
use crate::error::ChunkSettingsError;

/// Alignment of every chunk handed out by a mempool.
pub const CHUNK_MEMORY_ALIGNMENT: u32 = 8;
/// Payload alignment used when sizing configured mempools.
pub const DEFAULT_USER_PAYLOAD_ALIGNMENT: u32 = 8;
pub const MAX_NUMBER_OF_MEMPOOLS: usize = 32;

/// Environment variable holding a JSON [`MemPoolConfig`].
pub const CONFIG_ENV: &str = "CHUNK_POOL_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemPoolEntry {
    /// Largest user payload a chunk of this pool can carry.
    pub payload_size: u32,
    pub chunk_count: u32,
}

/// Mempools of a memory manager, ordered by increasing payload size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemPoolConfig {
    pub mempools: Vec<MemPoolEntry>,
}

impl Default for MemPoolConfig {
    fn default() -> Self {
        Self::empty()
            .add_mempool(128, 1000)
            .add_mempool(1024, 200)
            .add_mempool(16 * 1024, 20)
            .add_mempool(128 * 1024, 4)
    }
}

impl MemPoolConfig {
    pub fn empty() -> Self {
        Self {
            mempools: Vec::new(),
        }
    }

    pub fn add_mempool(mut self, payload_size: u32, chunk_count: u32) -> Self {
        self.mempools.push(MemPoolEntry {
            payload_size,
            chunk_count,
        });
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads [`CONFIG_ENV`], falling back to the default layout when it is
    /// unset or malformed.
    pub fn from_env() -> Self {
        let Ok(json) = std::env::var(CONFIG_ENV) else {
            return Self::default();
        };
        match Self::from_json(&json) {
            Ok(config) => {
                info!(mempools = config.mempools.len(), "Loaded mempool config from {CONFIG_ENV}");
                config
            }
            Err(e) => {
                error!("Failed to parse {CONFIG_ENV}, using default mempools: {e}");
                Self::default()
            }
        }
    }

    pub fn total_chunk_count(&self) -> u64 {
        self.mempools
            .iter()
            .map(|entry| u64::from(entry.chunk_count))
            .sum()
    }

    /// Bytes a data arena needs to hold every configured mempool.
    pub fn required_chunk_memory_size(&self) -> Result<usize, ChunkSettingsError> {
        let mut total = 0;
        for entry in &self.mempools {
            let settings =
                ChunkSettings::create(entry.payload_size, DEFAULT_USER_PAYLOAD_ALIGNMENT)?;
            let chunk_size = align_up(
                settings.required_chunk_size() as usize,
                CHUNK_MEMORY_ALIGNMENT as usize,
            );
            total += chunk_size * entry.chunk_count as usize + CHUNK_MEMORY_ALIGNMENT as usize;
        }
        Ok(total)
    }

    /// Bytes a management arena needs for the free lists and the control
    /// records of every chunk.
    pub fn required_management_memory_size(&self) -> usize {
        let link = size_of::<AtomicU32>();
        let total_chunks = self.total_chunk_count() as usize;
        let record = align_up(size_of::<ChunkManagement>(), CHUNK_MEMORY_ALIGNMENT as usize);

        let pool_links: usize = self
            .mempools
            .iter()
            .map(|entry| entry.chunk_count as usize * link + link)
            .sum();
        pool_links
            + total_chunks * record
            + CHUNK_MEMORY_ALIGNMENT as usize
            + total_chunks * link
            + link
    }
}

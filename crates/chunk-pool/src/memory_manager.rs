//! Size-class dispatch over a set of mempools.

use std::mem::size_of;

use tracing::info;
use tracing::warn;
use utils::BumpAllocator;
use utils::FixedStorage;

use crate::chunk_header::ChunkHeader;
use crate::chunk_header::ChunkSettings;
use crate::chunk_management::ChunkManagement;
use crate::config::MemPoolConfig;
use crate::config::DEFAULT_USER_PAYLOAD_ALIGNMENT;
use crate::config::MAX_NUMBER_OF_MEMPOOLS;
use crate::error::MemPoolError;
use crate::error::MemoryManagerError;
use crate::mem_pool::MemPool;
use crate::mem_pool::MemPoolInfo;
use crate::shared_chunk::SharedChunk;

/// Owns the payload mempools plus the pool their management records come
/// from, and hands out [`SharedChunk`]s from the smallest fitting mempool.
///
/// Outstanding chunks point back into the manager, so it must stay in place
/// (boxed, or laid out in a shared segment) until all of them are released.
#[repr(C)]
pub struct MemoryManager {
    mem_pools: FixedStorage<MemPool, MAX_NUMBER_OF_MEMPOOLS>,
    number_of_mem_pools: usize,
    chunk_management_pool: MemPool,
}

impl MemoryManager {
    /// Lays out every mempool of `config`. Payload chunks come from
    /// `chunk_allocator`, free lists and management records from
    /// `management_allocator`.
    pub fn new(
        config: &MemPoolConfig,
        chunk_allocator: &BumpAllocator,
        management_allocator: &BumpAllocator,
    ) -> Result<Self, MemoryManagerError> {
        let entries = &config.mempools;
        if entries.is_empty() {
            return Err(MemoryManagerError::NoMempoolsAvailable);
        }
        if entries.len() > MAX_NUMBER_OF_MEMPOOLS {
            return Err(MemoryManagerError::TooManyMempools(entries.len()));
        }
        if entries
            .windows(2)
            .any(|pair| pair[0].payload_size >= pair[1].payload_size)
        {
            return Err(MemoryManagerError::MempoolConfigMustBeOrderedByIncreasingSize);
        }
        let total_chunks = u32::try_from(config.total_chunk_count())
            .map_err(|_| MemPoolError::InvalidChunkCount(u32::MAX))?;

        let mem_pools = FixedStorage::new();
        for (index, entry) in entries.iter().enumerate() {
            let settings =
                ChunkSettings::create(entry.payload_size, DEFAULT_USER_PAYLOAD_ALIGNMENT)?;
            let mem_pool = MemPool::new(
                settings.required_chunk_size(),
                entry.chunk_count,
                chunk_allocator,
                management_allocator,
            )?;
            unsafe { mem_pools.write(index, mem_pool) };
        }
        let chunk_management_pool = MemPool::new(
            size_of::<ChunkManagement>() as u32,
            total_chunks,
            management_allocator,
            management_allocator,
        )?;

        info!(
            mem_pools = entries.len(),
            total_chunks,
            chunk_memory = chunk_allocator.used(),
            management_memory = management_allocator.used(),
            "Memory manager configured"
        );
        Ok(Self {
            mem_pools,
            number_of_mem_pools: entries.len(),
            chunk_management_pool,
        })
    }

    fn mem_pools(&self) -> &[MemPool] {
        unsafe { std::slice::from_raw_parts(self.mem_pools.ptr(0), self.number_of_mem_pools) }
    }

    /// Takes a chunk from the first mempool whose chunks can hold `settings`.
    pub fn get_chunk(&self, settings: &ChunkSettings) -> Result<SharedChunk, MemoryManagerError> {
        let required = settings.required_chunk_size();
        let Some(mem_pool) = self
            .mem_pools()
            .iter()
            .find(|mem_pool| mem_pool.chunk_size() >= required)
        else {
            warn!(required, "No mempool for the requested chunk size");
            return Err(MemoryManagerError::NoMempoolForRequestedChunkSize { required });
        };

        let chunk = mem_pool.get_chunk().inspect_err(|_| {
            warn!(
                chunk_size = mem_pool.chunk_size(),
                chunk_count = mem_pool.chunk_count(),
                "Mempool is out of chunks"
            );
        })?;
        let block = match self.chunk_management_pool.get_chunk() {
            Ok(block) => block,
            Err(e) => {
                mem_pool.free_chunk(chunk);
                warn!("Chunk management pool is out of chunks");
                return Err(e.into());
            }
        };

        unsafe {
            let chunk_header = ChunkHeader::emplace(chunk, mem_pool.chunk_size(), settings);
            let record = ChunkManagement::emplace(
                block,
                chunk_header,
                mem_pool,
                &self.chunk_management_pool,
            );
            Ok(SharedChunk::from_raw(record.as_ptr()))
        }
    }

    pub fn number_of_mem_pools(&self) -> usize {
        self.number_of_mem_pools
    }

    pub fn mem_pool_info(&self, index: usize) -> Option<MemPoolInfo> {
        self.mem_pools().get(index).map(MemPool::info)
    }

    pub fn chunk_management_pool_info(&self) -> MemPoolInfo {
        self.chunk_management_pool.info()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mem_pool::tests::Arena;

    struct Fixture {
        _chunk_arena: Arena,
        _management_arena: Arena,
        manager: MemoryManager,
    }

    fn manager(config: &MemPoolConfig) -> Result<Box<Fixture>, MemoryManagerError> {
        let chunk_arena = Arena::new();
        let management_arena = Arena::new();
        let manager = MemoryManager::new(
            config,
            &chunk_arena.allocator(),
            &management_arena.allocator(),
        )?;
        Ok(Box::new(Fixture {
            _chunk_arena: chunk_arena,
            _management_arena: management_arena,
            manager,
        }))
    }

    fn settings(payload_size: u32) -> ChunkSettings {
        ChunkSettings::create(payload_size, DEFAULT_USER_PAYLOAD_ALIGNMENT).unwrap()
    }

    #[test]
    fn rejects_invalid_configs() {
        assert_eq!(
            manager(&MemPoolConfig::empty()).err().unwrap(),
            MemoryManagerError::NoMempoolsAvailable
        );

        let too_many = (1..=33).fold(MemPoolConfig::empty(), |config, i| {
            config.add_mempool(i * 8, 1)
        });
        assert_eq!(
            manager(&too_many).err().unwrap(),
            MemoryManagerError::TooManyMempools(33)
        );

        let unordered = MemPoolConfig::empty().add_mempool(64, 1).add_mempool(32, 1);
        assert_eq!(
            manager(&unordered).err().unwrap(),
            MemoryManagerError::MempoolConfigMustBeOrderedByIncreasingSize
        );

        let duplicated = MemPoolConfig::empty().add_mempool(64, 1).add_mempool(64, 1);
        assert_eq!(
            manager(&duplicated).err().unwrap(),
            MemoryManagerError::MempoolConfigMustBeOrderedByIncreasingSize
        );

        let empty_pool = MemPoolConfig::empty().add_mempool(64, 0);
        assert_eq!(
            manager(&empty_pool).err().unwrap(),
            MemoryManagerError::MemPool(MemPoolError::InvalidChunkCount(0))
        );
    }

    #[test]
    fn lays_out_one_pool_per_entry() {
        let config = MemPoolConfig::empty().add_mempool(32, 10).add_mempool(128, 5);
        let fixture = manager(&config).unwrap();
        let manager = &fixture.manager;

        assert_eq!(manager.number_of_mem_pools(), 2);
        assert_eq!(manager.mem_pool_info(0).unwrap().chunk_size, 64);
        assert_eq!(manager.mem_pool_info(0).unwrap().num_chunks, 10);
        assert_eq!(manager.mem_pool_info(1).unwrap().chunk_size, 160);
        assert_eq!(manager.mem_pool_info(2), None);
        assert_eq!(manager.chunk_management_pool_info().num_chunks, 15);
    }

    #[test]
    fn picks_smallest_fitting_pool() {
        let config = MemPoolConfig::empty()
            .add_mempool(32, 10)
            .add_mempool(64, 10)
            .add_mempool(128, 10);
        let fixture = manager(&config).unwrap();
        let manager = &fixture.manager;

        let small = manager.get_chunk(&settings(16)).unwrap();
        let exact = manager.get_chunk(&settings(64)).unwrap();
        let large = manager.get_chunk(&settings(65)).unwrap();

        assert_eq!(manager.mem_pool_info(0).unwrap().used_chunks, 1);
        assert_eq!(manager.mem_pool_info(1).unwrap().used_chunks, 1);
        assert_eq!(manager.mem_pool_info(2).unwrap().used_chunks, 1);
        assert_eq!(manager.chunk_management_pool_info().used_chunks, 3);

        assert_eq!(small.chunk_header().unwrap().user_payload_size(), 16);
        assert_eq!(exact.chunk_header().unwrap().chunk_size(), 96);
        assert_eq!(large.chunk_header().unwrap().chunk_size(), 160);

        drop((small, exact, large));
        for index in 0..3 {
            assert_eq!(manager.mem_pool_info(index).unwrap().used_chunks, 0);
        }
        assert_eq!(manager.chunk_management_pool_info().used_chunks, 0);
    }

    #[test]
    fn oversized_request_fails() {
        let fixture = manager(&MemPoolConfig::empty().add_mempool(64, 4)).unwrap();
        assert_eq!(
            fixture.manager.get_chunk(&settings(65)).unwrap_err(),
            MemoryManagerError::NoMempoolForRequestedChunkSize { required: 32 + 65 }
        );
    }

    #[test]
    fn exhausted_pool_does_not_fall_through_to_larger_one() {
        let config = MemPoolConfig::empty().add_mempool(32, 1).add_mempool(64, 1);
        let fixture = manager(&config).unwrap();
        let manager = &fixture.manager;

        let _held = manager.get_chunk(&settings(32)).unwrap();
        assert_eq!(
            manager.get_chunk(&settings(32)).unwrap_err(),
            MemoryManagerError::MemPool(MemPoolError::PoolExhausted)
        );
        assert_eq!(manager.mem_pool_info(1).unwrap().used_chunks, 0);
        assert_eq!(manager.chunk_management_pool_info().used_chunks, 1);
    }

    #[test]
    fn payload_chunk_is_returned_when_management_pool_is_exhausted() {
        let fixture = manager(&MemPoolConfig::empty().add_mempool(64, 2)).unwrap();
        let manager = &fixture.manager;

        let blocks: Vec<_> = std::iter::from_fn(|| manager.chunk_management_pool.get_chunk().ok())
            .collect();
        assert_eq!(blocks.len(), 2);

        assert_eq!(
            manager.get_chunk(&settings(8)).unwrap_err(),
            MemoryManagerError::MemPool(MemPoolError::PoolExhausted)
        );
        assert_eq!(manager.mem_pool_info(0).unwrap().used_chunks, 0);

        for block in blocks {
            manager.chunk_management_pool.free_chunk(block);
        }
        assert!(manager.get_chunk(&settings(8)).is_ok());
    }

    #[test]
    fn payload_is_usable_and_aligned() {
        let fixture = manager(&MemPoolConfig::empty().add_mempool(256, 2)).unwrap();
        let settings = ChunkSettings::create(100, 64).unwrap();
        let chunk = fixture.manager.get_chunk(&settings).unwrap();

        let payload = chunk.user_payload().unwrap();
        assert_eq!(payload.as_ptr() as usize % 64, 0);
        unsafe { payload.as_ptr().write_bytes(0x5A, 100) };
        let copy = chunk.clone();
        let bytes = unsafe { std::slice::from_raw_parts(copy.user_payload().unwrap().as_ptr(), 100) };
        assert!(bytes.iter().all(|byte| *byte == 0x5A));
    }

    #[test]
    fn required_memory_sizes_are_sufficient() {
        let config = MemPoolConfig::empty()
            .add_mempool(32, 7)
            .add_mempool(100, 3)
            .add_mempool(1000, 2);
        let chunk_memory = config.required_chunk_memory_size().unwrap();
        let management_memory = config.required_management_memory_size();
        let chunk_arena = Arena::new();
        let management_arena = Arena::new();

        // allocators restricted to exactly the advertised sizes
        let chunk_allocator = unsafe {
            BumpAllocator::from_raw(chunk_arena.allocator().base(), chunk_memory)
        };
        let management_allocator = unsafe {
            BumpAllocator::from_raw(management_arena.allocator().base(), management_memory)
        };
        let manager = MemoryManager::new(&config, &chunk_allocator, &management_allocator);
        assert!(manager.is_ok());
    }
}

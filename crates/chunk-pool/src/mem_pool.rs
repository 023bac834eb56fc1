//! Fixed block-size pools.

use std::mem::align_of;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::debug;
use utils::allocator::align_up;
use utils::BumpAllocator;
use utils::RelativePointer;

use crate::config::CHUNK_MEMORY_ALIGNMENT;
use crate::error::MemPoolError;
use crate::free_list::IndexFreeList;

/// Usage snapshot of a [`MemPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemPoolInfo {
    pub used_chunks: u32,
    pub min_free_chunks: u32,
    pub num_chunks: u32,
    pub chunk_size: u32,
}

/// `chunk_count` equally sized chunks carved out of one contiguous arena.
///
/// Chunks are handed out and returned lock-free from any thread. The pool only
/// stores relative pointers, so it may itself live in shared memory.
#[repr(C)]
pub struct MemPool {
    raw_memory: RelativePointer<u8>,
    chunk_size: u32,
    chunk_count: u32,
    used_chunks: AtomicU32,
    min_free: AtomicU32,
    free_list: IndexFreeList,
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("raw_memory", &self.raw_memory)
            .field("info", &self.info())
            .finish()
    }
}

impl MemPool {
    /// Takes the chunk arena from `chunk_allocator` and the free list links
    /// from `management_allocator`. `chunk_size` is rounded up to
    /// [`CHUNK_MEMORY_ALIGNMENT`].
    pub fn new(
        chunk_size: u32,
        chunk_count: u32,
        chunk_allocator: &BumpAllocator,
        management_allocator: &BumpAllocator,
    ) -> Result<Self, MemPoolError> {
        if chunk_count == 0 || chunk_count == u32::MAX {
            return Err(MemPoolError::InvalidChunkCount(chunk_count));
        }
        if chunk_size == 0 {
            return Err(MemPoolError::InvalidChunkSize(chunk_size));
        }
        let aligned_size = align_up(chunk_size as usize, CHUNK_MEMORY_ALIGNMENT as usize);
        let aligned_size =
            u32::try_from(aligned_size).map_err(|_| MemPoolError::InvalidChunkSize(chunk_size))?;
        let arena_size = (aligned_size as usize)
            .checked_mul(chunk_count as usize)
            .ok_or(MemPoolError::InvalidChunkSize(chunk_size))?;

        let raw_memory =
            chunk_allocator.allocate(arena_size, CHUNK_MEMORY_ALIGNMENT as usize)?;
        let links = management_allocator
            .allocate(
                size_of::<AtomicU32>() * chunk_count as usize,
                align_of::<AtomicU32>(),
            )?
            .cast::<AtomicU32>();
        let free_list = unsafe { IndexFreeList::new(links, chunk_count) };

        debug!(chunk_size = aligned_size, chunk_count, "Created mempool");
        Ok(Self {
            raw_memory: RelativePointer::new(raw_memory.as_ptr()),
            chunk_size: aligned_size,
            chunk_count,
            used_chunks: AtomicU32::new(0),
            min_free: AtomicU32::new(chunk_count),
            free_list,
        })
    }

    /// Hands out an unused chunk, aligned to [`CHUNK_MEMORY_ALIGNMENT`].
    pub fn get_chunk(&self) -> Result<NonNull<u8>, MemPoolError> {
        let raw_memory = NonNull::new(self.raw_memory.get()).ok_or(MemPoolError::NotMapped)?;
        let Some(index) = self.free_list.pop() else {
            debug!(
                chunk_size = self.chunk_size,
                chunk_count = self.chunk_count,
                "Mempool exhausted"
            );
            return Err(MemPoolError::PoolExhausted);
        };

        let used = self.used_chunks.fetch_add(1, Ordering::Relaxed) + 1;
        self.min_free
            .fetch_min(self.chunk_count.saturating_sub(used), Ordering::Relaxed);

        let offset = index as usize * self.chunk_size as usize;
        Ok(unsafe { NonNull::new_unchecked(raw_memory.as_ptr().add(offset)) })
    }

    /// Returns a chunk previously obtained from [`MemPool::get_chunk`] on this
    /// pool. Handing in any other pointer corrupts the pool.
    pub fn free_chunk(&self, chunk: NonNull<u8>) {
        let base = self.raw_memory.get() as usize;
        let offset = (chunk.as_ptr() as usize).wrapping_sub(base);
        let index = offset / self.chunk_size as usize;
        debug_assert!(
            offset % self.chunk_size as usize == 0 && index < self.chunk_count as usize,
            "chunk {chunk:p} does not belong to this mempool"
        );

        // a slot must leave `used_chunks` before it can be popped again
        let previous = self.used_chunks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "more chunks freed than handed out");
        self.free_list.push(index as u32);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn used_chunks(&self) -> u32 {
        self.used_chunks.load(Ordering::Relaxed)
    }

    pub fn free_chunks(&self) -> u32 {
        self.chunk_count.saturating_sub(self.used_chunks())
    }

    /// Lowest number of free chunks seen since creation.
    pub fn min_free_chunks(&self) -> u32 {
        self.min_free.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> MemPoolInfo {
        MemPoolInfo {
            used_chunks: self.used_chunks(),
            min_free_chunks: self.min_free_chunks(),
            num_chunks: self.chunk_count,
            chunk_size: self.chunk_size,
        }
    }
}

//! Per-chunk control record.

use std::mem::align_of;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::error;
use utils::RelativePointer;

use crate::chunk_header::ChunkHeader;
use crate::mem_pool::MemPool;

/// Reference count of a chunk plus everything needed to hand it back: the
/// header and the two pools the chunk and this record came from.
///
/// Lives in a block of the chunk management pool. All links are relative so
/// a record written by one process can be followed by another.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkManagement {
    chunk_header: RelativePointer<ChunkHeader>,
    reference_counter: AtomicU64,
    mem_pool: RelativePointer<MemPool>,
    chunk_management_pool: RelativePointer<MemPool>,
}

impl ChunkManagement {
    /// Writes a record with a reference count of one into `block`.
    ///
    /// # Safety
    /// `block` must be an unused chunk of `chunk_management_pool`, large and
    /// aligned enough for a `ChunkManagement`. `chunk_header` must sit at the
    /// start of a chunk of `mem_pool`. Neither pool may move while the record
    /// is alive.
    pub(crate) unsafe fn emplace(
        block: NonNull<u8>,
        chunk_header: NonNull<ChunkHeader>,
        mem_pool: &MemPool,
        chunk_management_pool: &MemPool,
    ) -> NonNull<ChunkManagement> {
        debug_assert!(chunk_management_pool.chunk_size() as usize >= size_of::<Self>());
        debug_assert_eq!(block.as_ptr() as usize % align_of::<Self>(), 0);

        let record = block.cast::<ChunkManagement>();
        record.as_ptr().write(ChunkManagement {
            chunk_header: RelativePointer::new(chunk_header.as_ptr()),
            reference_counter: AtomicU64::new(1),
            mem_pool: RelativePointer::new(mem_pool),
            chunk_management_pool: RelativePointer::new(chunk_management_pool),
        });
        record
    }

    /// Null if the header's segment is not mapped in this process.
    pub fn chunk_header(&self) -> *mut ChunkHeader {
        self.chunk_header.get()
    }

    pub fn mem_pool(&self) -> Option<&MemPool> {
        unsafe { self.mem_pool.get().as_ref() }
    }

    pub fn chunk_management_pool(&self) -> Option<&MemPool> {
        unsafe { self.chunk_management_pool.get().as_ref() }
    }

    pub fn reference_count(&self) -> u64 {
        self.reference_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self) {
        let previous = self.reference_counter.fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "reference added to a released chunk");
    }

    /// Returns `true` if this dropped the last reference. The caller then owns
    /// the record exclusively and must [`ChunkManagement::free`] it.
    pub(crate) fn decrement(&self) -> bool {
        let previous = self.reference_counter.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "reference dropped from a released chunk");
        if previous != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    /// Hands the payload chunk and the record itself back to their pools.
    ///
    /// # Safety
    /// The reference count must have dropped to zero and nobody may touch the
    /// record afterwards.
    pub(crate) unsafe fn free(record: NonNull<ChunkManagement>) {
        let management = record.as_ref();
        let chunk_header = NonNull::new(management.chunk_header());
        let mem_pool = management.mem_pool();
        let chunk_management_pool = management.chunk_management_pool();

        match (chunk_header, mem_pool) {
            (Some(chunk_header), Some(mem_pool)) => mem_pool.free_chunk(chunk_header.cast()),
            _ => error!(
                segment_id = %management.chunk_header.segment_id(),
                "Mempool of a released chunk is not mapped, chunk leaked"
            ),
        }
        match chunk_management_pool {
            Some(pool) => pool.free_chunk(record.cast()),
            None => error!("Chunk management pool is not mapped, record leaked"),
        }
    }
}

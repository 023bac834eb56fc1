//! Reference-counted chunk handles.

use std::fmt;
use std::ptr::NonNull;

use utils::RelativePointer;

use crate::chunk_header::ChunkHeader;
use crate::chunk_management::ChunkManagement;

/// A counted reference to a chunk.
///
/// Cloning adds a reference, dropping removes one, and whoever drops the last
/// reference returns the payload chunk and its management record to their
/// pools. A default constructed handle is empty and refers to nothing.
#[derive(Default)]
pub struct SharedChunk {
    chunk_management: Option<NonNull<ChunkManagement>>,
}

// The record is only ever touched through atomics.
unsafe impl Send for SharedChunk {}
unsafe impl Sync for SharedChunk {}

impl SharedChunk {
    /// Adopts a record whose reference count already accounts for this
    /// handle. A null pointer gives an empty handle.
    ///
    /// # Safety
    /// A non-null `chunk_management` must point to a live record and the
    /// adopted reference must not be released by anyone else.
    pub unsafe fn from_raw(chunk_management: *mut ChunkManagement) -> Self {
        Self {
            chunk_management: NonNull::new(chunk_management),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.chunk_management.is_some()
    }

    fn management(&self) -> Option<&ChunkManagement> {
        self.chunk_management
            .map(|record| unsafe { &*record.as_ptr() })
    }

    pub fn chunk_header(&self) -> Option<&ChunkHeader> {
        self.management()
            .and_then(|record| unsafe { record.chunk_header().as_ref() })
    }

    pub fn user_payload(&self) -> Option<NonNull<u8>> {
        self.chunk_header().map(ChunkHeader::user_payload)
    }

    /// Number of handles sharing the chunk, zero for an empty handle.
    pub fn reference_count(&self) -> u64 {
        self.management().map_or(0, ChunkManagement::reference_count)
    }

    /// Moves the reference out, leaving this handle empty.
    pub fn take(&mut self) -> SharedChunk {
        std::mem::take(self)
    }

    /// Gives up this handle's reference without decrementing the count. The
    /// caller becomes responsible for it, typically by passing the pointer to
    /// [`SharedChunk::from_raw`] later on.
    pub fn release(&mut self) -> Option<NonNull<ChunkManagement>> {
        self.chunk_management.take()
    }

    /// Turns the handle into a form that can be stored in shared memory. The
    /// reference travels with the [`ChunkRef`].
    pub fn into_chunk_ref(mut self) -> ChunkRef {
        let record = self
            .release()
            .map_or(std::ptr::null(), |record| record.as_ptr().cast_const());
        ChunkRef {
            chunk_management: RelativePointer::new(record),
        }
    }

    /// Picks up the reference carried by `chunk_ref`. Gives an empty handle if
    /// the record is not mapped in this process.
    ///
    /// # Safety
    /// `chunk_ref` must come from [`SharedChunk::into_chunk_ref`] and be
    /// consumed exactly once.
    pub unsafe fn from_chunk_ref(chunk_ref: ChunkRef) -> Self {
        Self::from_raw(chunk_ref.chunk_management.get())
    }
}

impl Clone for SharedChunk {
    fn clone(&self) -> Self {
        if let Some(record) = self.management() {
            record.increment();
        }
        Self {
            chunk_management: self.chunk_management,
        }
    }
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        let Some(record) = self.chunk_management.take() else {
            return;
        };
        unsafe {
            if record.as_ref().decrement() {
                ChunkManagement::free(record);
            }
        }
    }
}

impl PartialEq for SharedChunk {
    fn eq(&self, other: &Self) -> bool {
        self.chunk_management == other.chunk_management
    }
}

impl Eq for SharedChunk {}

impl PartialEq<NonNull<u8>> for SharedChunk {
    fn eq(&self, user_payload: &NonNull<u8>) -> bool {
        self.user_payload() == Some(*user_payload)
    }
}

impl PartialEq<SharedChunk> for NonNull<u8> {
    fn eq(&self, chunk: &SharedChunk) -> bool {
        chunk == self
    }
}

impl fmt::Debug for SharedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChunk")
            .field("chunk_management", &self.chunk_management)
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// A [`SharedChunk`] reference in transit, e.g. inside a shared memory queue.
///
/// Copying a `ChunkRef` does not add a reference; exactly one copy must be
/// turned back into a handle with [`SharedChunk::from_chunk_ref`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkRef {
    chunk_management: RelativePointer<ChunkManagement>,
}

impl ChunkRef {
    pub fn is_null(&self) -> bool {
        self.chunk_management.is_null()
    }
}

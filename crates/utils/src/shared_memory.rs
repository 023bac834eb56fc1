//! Shared memory segments that relative pointers can point into.
//!
//! A segment is created once by the process that lays out the pools and opened
//! by every other participant. All of them register their own mapping under
//! the same [`SegmentId`], so a [`RelativePointer`](crate::RelativePointer)
//! written by one process resolves to the same object in another.

use std::ptr::NonNull;

use anyhow::Context;
use anyhow::Result;
use shared_memory::Shmem;
use shared_memory::ShmemConf;
use spin::Mutex;
use tracing::info;

use crate::allocator::BumpAllocator;
use crate::relative_ptr;
use crate::relative_ptr::SegmentId;

/// A mapped shared memory segment registered for relative addressing.
pub struct SharedSegment {
    shmem: Mutex<Shmem>,
    base: NonNull<u8>,
    len: usize,
    os_id: String,
    segment_id: SegmentId,
}

// The mapping is only handed out as raw memory; all shared state inside it is
// accessed through atomics. The `Shmem` handle itself sits behind the mutex.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Creates a new segment of `size` bytes and registers it under `segment_id`.
    pub fn create(os_id: &str, size: usize, segment_id: SegmentId) -> Result<Self> {
        let old_umask = unsafe { libc::umask(0) };
        let shmem = ShmemConf::new().size(size).os_id(os_id).create();
        unsafe {
            libc::umask(old_umask);
        }
        let shmem = shmem
            .map_err(|e| anyhow::anyhow!("Failed to create shared memory `{os_id}`: {e}"))?;

        let segment = Self::from_shmem(shmem, os_id, segment_id)?;
        info!(
            os_id = %os_id,
            segment_id = %segment_id,
            size = segment.len,
            "Created shared memory segment"
        );
        Ok(segment)
    }

    /// Maps an existing segment and registers it under `segment_id`.
    pub fn open(os_id: &str, segment_id: SegmentId) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(os_id)
            .open()
            .map_err(|e| anyhow::anyhow!("Failed to open shared memory `{os_id}`: {e}"))?;

        let segment = Self::from_shmem(shmem, os_id, segment_id)?;
        info!(
            os_id = %os_id,
            segment_id = %segment_id,
            size = segment.len,
            "Opened shared memory segment"
        );
        Ok(segment)
    }

    fn from_shmem(shmem: Shmem, os_id: &str, segment_id: SegmentId) -> Result<Self> {
        let base = NonNull::new(shmem.as_ptr()).context("Shared memory mapped at null")?;
        let segment = Self {
            len: shmem.len(),
            shmem: Mutex::new(shmem),
            base,
            os_id: os_id.to_string(),
            segment_id,
        };
        segment.register()?;
        Ok(segment)
    }

    /// Makes relative pointers with this segment's id resolve into this mapping.
    pub fn register(&self) -> Result<()> {
        relative_ptr::register_segment_with_id(self.segment_id, self.base.as_ptr(), self.len)
            .with_context(|| format!("Failed to register shared memory `{}`", self.os_id))
    }

    /// Returns `false` if the id is not registered for this mapping.
    pub fn unregister(&self) -> bool {
        if relative_ptr::segment_base(self.segment_id) != Some(self.base.as_ptr()) {
            return false;
        }
        relative_ptr::unregister_segment(self.segment_id)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    /// Whether dropping this handle removes the OS object.
    pub fn is_owner(&self) -> bool {
        self.shmem.lock().is_owner()
    }

    pub fn set_owner(&self, is_owner: bool) {
        self.shmem.lock().set_owner(is_owner);
    }

    /// An allocator over the whole mapping. Only the process laying out the
    /// segment should allocate, and nothing allocated may outlive `self`.
    pub fn allocator(&self) -> BumpAllocator {
        unsafe { BumpAllocator::from_raw(self.base, self.len) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if relative_ptr::segment_base(self.segment_id) == Some(self.base.as_ptr()) {
            relative_ptr::unregister_segment(self.segment_id);
        }
        if self.shmem.get_mut().is_owner() {
            info!(os_id = %self.os_id, "Removing shared memory segment");
        } else {
            info!(os_id = %self.os_id, "Detaching from shared memory segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn test_id(tag: &str) -> String {
        format!("utils_segment_{tag}_{}", std::process::id())
    }

    #[test]
    fn second_mapping_sees_the_same_bytes() {
        let os_id = test_id("mapping");
        let owner = SharedSegment::create(&os_id, 4096, SegmentId::new(50)).unwrap();
        assert!(owner.is_owner());
        unsafe { owner.as_ptr().add(100).write(0xAB) };

        let other = SharedSegment::open(&os_id, SegmentId::new(51)).unwrap();
        assert!(!other.is_owner());
        assert_eq!(unsafe { other.as_ptr().add(100).read() }, 0xAB);
        assert!(other.len() >= 4096);
    }

    #[test]
    fn mapping_is_registered_until_dropped() {
        let os_id = test_id("registry");
        let id = SegmentId::new(52);
        let segment = SharedSegment::create(&os_id, 1024, id).unwrap();
        assert_eq!(relative_ptr::segment_base(id), Some(segment.as_ptr()));

        assert!(segment.unregister());
        assert!(!segment.unregister());
        segment.register().unwrap();

        drop(segment);
        assert_eq!(relative_ptr::segment_base(id), None);
    }

    #[test]
    fn segment_is_removed_with_its_owner() {
        let os_id = test_id("cleanup");
        let segment = SharedSegment::create(&os_id, 1024, SegmentId::new(53)).unwrap();
        drop(segment);

        assert!(SharedSegment::open(&os_id, SegmentId::new(53)).is_err());
    }

    #[test]
    fn allocator_hands_out_memory_inside_the_mapping() {
        let os_id = test_id("allocator");
        let segment = SharedSegment::create(&os_id, 4096, SegmentId::new(54)).unwrap();
        let allocator = segment.allocator();

        let ptr = allocator.allocate(128, 64).unwrap().as_ptr() as usize;
        let base = segment.as_ptr() as usize;
        assert!(ptr >= base && ptr + 128 <= base + segment.len());
    }

    #[test]
    fn ownership_can_be_handed_over_from_any_thread() {
        let os_id = test_id("ownership");
        let segment = SharedSegment::create(&os_id, 1024, SegmentId::new(55)).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for round in 0..1000 {
                        segment.set_owner(round % 2 == 0);
                        let _ = segment.is_owner();
                    }
                });
            }
        });

        segment.set_owner(true);
        assert!(segment.is_owner());
        drop(segment);
        assert!(SharedSegment::open(&os_id, SegmentId::new(55)).is_err());
    }
}

//! Bump allocation over a preallocated memory region.
//!
//! Pools and shared structures are carved out of a region once, during setup,
//! and never returned individually. The region itself is owned elsewhere (a
//! shared memory segment, a static buffer in tests).

use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("out of memory: requested {requested} bytes, {available} bytes left")]
    OutOfMemory { requested: usize, available: usize },

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}

/// Hands out consecutive, aligned pieces of a fixed memory region.
#[derive(Debug)]
pub struct BumpAllocator {
    base: NonNull<u8>,
    size: usize,
    offset: AtomicUsize,
}

unsafe impl Send for BumpAllocator {}
unsafe impl Sync for BumpAllocator {}

impl BumpAllocator {
    /// # Safety
    /// `base` must be valid for reads and writes of `size` bytes for as long as
    /// anything allocated from this allocator is in use.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize) -> Self {
        Self {
            base,
            size,
            offset: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocatorError> {
        if !align.is_power_of_two() {
            return Err(AllocatorError::InvalidAlignment(align));
        }

        let base_addr = self.base.as_ptr() as usize;
        let mut current = self.offset.load(Ordering::Acquire);
        loop {
            let aligned = align_up(base_addr + current, align) - base_addr;
            let end = aligned
                .checked_add(size)
                .filter(|end| *end <= self.size)
                .ok_or(AllocatorError::OutOfMemory {
                    requested: size,
                    available: self.size.saturating_sub(current),
                })?;

            match self
                .offset
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire)
            {
                // `end <= self.size`, so the pointer stays inside the region.
                Ok(_) => return Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(aligned)) }),
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Moves `value` into the region and returns where it was placed.
    pub fn emplace<T>(&self, value: T) -> Result<NonNull<T>, AllocatorError> {
        let ptr = self
            .allocate(std::mem::size_of::<T>(), std::mem::align_of::<T>())?
            .cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

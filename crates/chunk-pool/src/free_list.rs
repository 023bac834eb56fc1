//! Lock-free stack of slot indices.
//!
//! The head packs the index on top of the stack (low 32 bits) with a tag
//! (high 32 bits) that changes on every successful update, so a head that was
//! popped and pushed back in between is not mistaken for an unchanged one.

use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::error;
use utils::RelativePointer;

const INVALID_INDEX: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

#[repr(C)]
pub(crate) struct IndexFreeList {
    head: AtomicU64,
    links: RelativePointer<AtomicU32>,
    capacity: u32,
}

impl IndexFreeList {
    /// Links all `capacity` slots into the stack, lowest index on top.
    ///
    /// # Safety
    /// `links` must point to `capacity` writable, suitably aligned `AtomicU32`
    /// slots that stay valid and in place for the lifetime of the list.
    pub(crate) unsafe fn new(links: NonNull<AtomicU32>, capacity: u32) -> Self {
        debug_assert!(capacity < INVALID_INDEX);
        for index in 0..capacity {
            let next = if index + 1 < capacity {
                index + 1
            } else {
                INVALID_INDEX
            };
            links.as_ptr().add(index as usize).write(AtomicU32::new(next));
        }

        let top = if capacity == 0 { INVALID_INDEX } else { 0 };
        Self {
            head: AtomicU64::new(pack(0, top)),
            links: RelativePointer::new(links.as_ptr()),
            capacity,
        }
    }

    pub(crate) fn pop(&self) -> Option<u32> {
        let links = self.links()?;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            if top == INVALID_INDEX {
                return None;
            }
            // may be stale if another caller popped `top` meanwhile; the tag
            // makes the exchange below fail in that case
            let next = links[top as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => head = actual,
            }
        }
    }

    pub(crate) fn push(&self, index: u32) {
        debug_assert!(index < self.capacity, "index {index} out of range");
        let Some(links) = self.links() else {
            error!(index, "free list is not mapped in this process, slot leaked");
            return;
        };
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (tag, top) = unpack(head);
            links[index as usize].store(top, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn links(&self) -> Option<&[AtomicU32]> {
        let links = self.links.get();
        if links.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(links, self.capacity as usize) })
    }
}

//! Pointers that stay meaningful across processes.
//!
//! A shared memory segment is mapped at a different address in every process.
//! Each process registers its own mapping of a segment under an id that all
//! participants agree on, and pointers stored in shared memory are kept as
//! `{segment id, offset}` pairs that are resolved against the local mapping on
//! every access.
//!
//! Memory that is not part of any registered segment is addressed through
//! [`SegmentId::RAW`], whose offset is the plain process-local address.

use std::fmt;
use std::marker::PhantomData;

use spin::RwLock;
use thiserror::Error;
use tracing::debug;

/// Number of registry slots, including the reserved raw slot 0.
pub const MAX_SEGMENTS: usize = 64;

const NULL_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const RAW: SegmentId = SegmentId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("segment id {0} is outside of 1..{MAX_SEGMENTS}")]
    InvalidId(SegmentId),

    #[error("segment id {0} is already registered")]
    IdInUse(SegmentId),

    #[error("all {MAX_SEGMENTS} segment ids are in use")]
    RegistryFull,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    base: usize,
    size: usize,
}

impl Segment {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

struct SegmentRegistry {
    segments: [Option<Segment>; MAX_SEGMENTS],
}

static REGISTRY: RwLock<SegmentRegistry> = RwLock::new(SegmentRegistry {
    segments: [None; MAX_SEGMENTS],
});

/// Registers a local mapping under the first free id.
pub fn register_segment(base: *const u8, size: usize) -> Result<SegmentId, RegistryError> {
    let mut registry = REGISTRY.write();
    let slot = (1..MAX_SEGMENTS)
        .find(|&i| registry.segments[i].is_none())
        .ok_or(RegistryError::RegistryFull)?;
    registry.segments[slot] = Some(Segment {
        base: base as usize,
        size,
    });

    let id = SegmentId(slot as u64);
    debug!(segment_id = %id, base = ?base, size, "registered segment");
    Ok(id)
}

/// Registers a local mapping under an id chosen by the segment's creator.
pub fn register_segment_with_id(
    id: SegmentId,
    base: *const u8,
    size: usize,
) -> Result<(), RegistryError> {
    let slot = slot_of(id).ok_or(RegistryError::InvalidId(id))?;
    let mut registry = REGISTRY.write();
    if registry.segments[slot].is_some() {
        return Err(RegistryError::IdInUse(id));
    }
    registry.segments[slot] = Some(Segment {
        base: base as usize,
        size,
    });

    debug!(segment_id = %id, base = ?base, size, "registered segment");
    Ok(())
}

/// Returns `false` if nothing was registered under `id`.
pub fn unregister_segment(id: SegmentId) -> bool {
    let Some(slot) = slot_of(id) else {
        return false;
    };
    let removed = REGISTRY.write().segments[slot].take().is_some();
    if removed {
        debug!(segment_id = %id, "unregistered segment");
    }
    removed
}

/// Local base address of a registered segment.
pub fn segment_base(id: SegmentId) -> Option<*mut u8> {
    let slot = slot_of(id)?;
    REGISTRY.read().segments[slot].map(|segment| segment.base as *mut u8)
}

fn slot_of(id: SegmentId) -> Option<usize> {
    let slot = usize::try_from(id.0).ok()?;
    (1..MAX_SEGMENTS).contains(&slot).then_some(slot)
}

fn locate(addr: usize) -> (SegmentId, u64) {
    let registry = REGISTRY.read();
    registry
        .segments
        .iter()
        .enumerate()
        .skip(1)
        .find_map(|(slot, segment)| {
            segment
                .filter(|segment| segment.contains(addr))
                .map(|segment| (SegmentId(slot as u64), (addr - segment.base) as u64))
        })
        .unwrap_or((SegmentId::RAW, addr as u64))
}

/// A `{segment id, offset}` pointer that can be stored in shared memory.
#[repr(C)]
pub struct RelativePointer<T> {
    id: u64,
    offset: u64,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for RelativePointer<T> {}
unsafe impl<T> Sync for RelativePointer<T> {}

impl<T> Clone for RelativePointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelativePointer<T> {}

impl<T> PartialEq for RelativePointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.offset == other.offset
    }
}

impl<T> Eq for RelativePointer<T> {}

impl<T> Default for RelativePointer<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for RelativePointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("RelativePointer(null)");
        }
        f.debug_struct("RelativePointer")
            .field("segment_id", &self.id)
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish()
    }
}

impl<T> RelativePointer<T> {
    pub const fn null() -> Self {
        Self {
            id: SegmentId::RAW.0,
            offset: NULL_OFFSET,
            _marker: PhantomData,
        }
    }

    /// Expresses `ptr` relative to the registered segment containing it.
    pub fn new(ptr: *const T) -> Self {
        if ptr.is_null() {
            return Self::null();
        }
        let (id, offset) = locate(ptr as usize);
        Self {
            id: id.0,
            offset,
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == NULL_OFFSET
    }

    pub fn segment_id(&self) -> SegmentId {
        SegmentId(self.id)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Resolves against this process' mapping. Null if the pointer is null or
    /// its segment is not registered here.
    pub fn get(&self) -> *mut T {
        if self.is_null() {
            return std::ptr::null_mut();
        }
        if self.id == SegmentId::RAW.0 {
            return self.offset as usize as *mut T;
        }
        match segment_base(SegmentId(self.id)) {
            Some(base) => base.wrapping_add(self.offset as usize).cast::<T>(),
            None => std::ptr::null_mut(),
        }
    }
}

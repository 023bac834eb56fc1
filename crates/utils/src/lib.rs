//! Building blocks shared by the chunk pool and the event notification crates.
//!
//! Everything in here is meant to be placed in, or to describe, memory that is
//! mapped by several processes at different virtual addresses.

pub mod allocator;
pub mod containers;
pub mod logging;
pub mod posix;
pub mod relative_ptr;
pub mod shared_memory;

pub use allocator::AllocatorError;
pub use allocator::BumpAllocator;
pub use containers::FixedStorage;
pub use relative_ptr::RelativePointer;
pub use relative_ptr::SegmentId;

//! Fixed-capacity containers without implicit allocation.

mod fixed_storage;

pub use fixed_storage::FixedStorage;

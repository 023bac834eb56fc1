use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// Raw, uninitialized storage for `N` elements of `T`.
///
/// The storage never constructs, drops, copies or moves its elements. Callers
/// place values with [`FixedStorage::write`] and are responsible for dropping
/// them. Once the storage sits in shared memory its address must not change,
/// which is why it implements neither `Clone` nor `Copy`.
#[repr(C)]
pub struct FixedStorage<T, const N: usize> {
    buffer: UnsafeCell<[MaybeUninit<T>; N]>,
}

unsafe impl<T: Send, const N: usize> Send for FixedStorage<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for FixedStorage<T, N> {}

impl<T, const N: usize> Default for FixedStorage<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> FixedStorage<T, N> {
    pub const fn new() -> Self {
        Self {
            buffer: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Pointer to the slot at `index`. No bounds check in release builds.
    #[inline]
    pub fn ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < N, "index {index} exceeds capacity {N}");
        (self.buffer.get() as *mut T).wrapping_add(index)
    }

    /// Places `value` at `index` without dropping whatever was there.
    ///
    /// # Safety
    /// `index < N` and no reference to that slot may be alive.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        self.ptr(index).write(value)
    }

    /// # Safety
    /// `index < N` and the slot must hold an initialized value.
    #[inline]
    pub unsafe fn get(&self, index: usize) -> &T {
        &*self.ptr(index)
    }

    /// # Safety
    /// `index < N` and the slot must hold an initialized value.
    #[inline]
    pub unsafe fn get_mut(&mut self, index: usize) -> &mut T {
        &mut *self.ptr(index)
    }

    /// # Safety
    /// Every slot must hold an initialized value.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[T] {
        std::slice::from_raw_parts(self.ptr(0), N)
    }
}

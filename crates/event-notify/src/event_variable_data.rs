use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use utils::FixedStorage;

pub const MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET: usize = 128;
pub const MAX_RUNTIME_NAME_LENGTH: usize = 100;

const MAX_SEMAPHORE_NAME_LENGTH: usize = 64;

static SEMAPHORE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Shared state between the notifiers of an event set and its listener.
///
/// Meant to be placed in shared memory, so it holds no process-local
/// pointers. The linked semaphore is referenced by name only.
#[repr(C)]
pub struct EventVariableData {
    runtime_name: [u8; MAX_RUNTIME_NAME_LENGTH],
    semaphore_name: [u8; MAX_SEMAPHORE_NAME_LENGTH],
    to_be_destroyed: AtomicBool,
    listener_generation: AtomicU64,
    active_notifications: FixedStorage<AtomicBool, MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET>,
}

impl Default for EventVariableData {
    fn default() -> Self {
        Self::new("")
    }
}

impl std::fmt::Debug for EventVariableData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventVariableData")
            .field("runtime_name", &self.runtime_name())
            .field("semaphore_name", &self.semaphore_name())
            .field("to_be_destroyed", &self.to_be_destroyed())
            .field("listener_generation", &self.listener_generation())
            .finish_non_exhaustive()
    }
}

impl EventVariableData {
    /// `runtime_name` identifies the owning runtime and is cut to
    /// [`MAX_RUNTIME_NAME_LENGTH`] bytes.
    pub fn new(runtime_name: &str) -> Self {
        let semaphore_name = format!(
            "ev_{}_{}",
            std::process::id(),
            SEMAPHORE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let active_notifications = FixedStorage::new();
        for index in 0..MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET {
            unsafe { active_notifications.write(index, AtomicBool::new(false)) };
        }

        Self {
            runtime_name: copy_truncated(runtime_name),
            semaphore_name: copy_truncated(&semaphore_name),
            to_be_destroyed: AtomicBool::new(false),
            listener_generation: AtomicU64::new(0),
            active_notifications,
        }
    }

    pub fn runtime_name(&self) -> &str {
        as_str(&self.runtime_name)
    }

    /// Name of the semaphore the listener waits on.
    pub fn semaphore_name(&self) -> &str {
        as_str(&self.semaphore_name)
    }

    /// Flag of event slot `index`, `None` outside the event set.
    pub fn notification(&self, index: usize) -> Option<&AtomicBool> {
        self.notifications().get(index)
    }

    pub fn notifications(&self) -> &[AtomicBool] {
        // every slot is written in `new`
        unsafe { self.active_notifications.as_slice() }
    }

    pub fn to_be_destroyed(&self) -> bool {
        self.to_be_destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_to_be_destroyed(&self) {
        self.to_be_destroyed.store(true, Ordering::Release);
    }

    /// Number of listeners attached so far. Zero means the semaphore was
    /// never created.
    pub fn listener_generation(&self) -> u64 {
        self.listener_generation.load(Ordering::Acquire)
    }

    /// Called by a listener once its semaphore exists.
    pub(crate) fn attach_listener(&self) -> u64 {
        self.to_be_destroyed.store(false, Ordering::Release);
        self.listener_generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

fn copy_truncated<const L: usize>(value: &str) -> [u8; L] {
    let mut end = value.len().min(L);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut buffer = [0; L];
    buffer[..end].copy_from_slice(&value.as_bytes()[..end]);
    buffer
}

fn as_str(buffer: &[u8]) -> &str {
    let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    std::str::from_utf8(&buffer[..len]).unwrap_or_default()
}

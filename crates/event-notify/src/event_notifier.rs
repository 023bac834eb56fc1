use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use spin::Mutex;
use tracing::debug;
use tracing::warn;
use utils::posix::NamedSemaphore;
use utils::posix::NamedSemaphoreBuilder;
use utils::posix::OpenMode;

use crate::event_variable_data::EventVariableData;
use crate::event_variable_data::MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET;

/// Semaphore of one listener generation. `None` if opening it failed, which
/// is then not retried until the next listener attaches.
struct CachedSemaphore {
    generation: u64,
    semaphore: Option<NamedSemaphore>,
}

/// Signals one event slot of an [`EventVariableData`].
pub struct EventNotifier<'a> {
    data: &'a EventVariableData,
    index: u64,
    semaphore: Mutex<Option<CachedSemaphore>>,
}

impl<'a> EventNotifier<'a> {
    /// An `index` outside the event set gives a notifier whose `notify` does
    /// nothing.
    pub fn new(data: &'a EventVariableData, index: u64) -> Self {
        if index >= MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET as u64 {
            warn!(
                index,
                max = MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET,
                "Event notifier index out of range, notifications are ignored"
            );
        }
        Self {
            data,
            index,
            semaphore: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Raises the slot's flag and wakes the listener. Never fails: a missing
    /// listener semaphore only logs a warning.
    pub fn notify(&self) {
        let Some(flag) = self.flag() else {
            return;
        };
        flag.store(true, Ordering::Release);

        let generation = self.data.listener_generation();
        if generation == 0 {
            debug!(index = self.index, "No event listener attached yet");
            return;
        }

        let mut cached = self.semaphore.lock();
        if cached.as_ref().map(|c| c.generation) != Some(generation) {
            // a new listener purged and recreated the semaphore under the same name
            *cached = Some(CachedSemaphore {
                generation,
                semaphore: self.open_semaphore(),
            });
        }
        let Some(semaphore) = cached.as_ref().and_then(|c| c.semaphore.as_ref()) else {
            return;
        };
        if let Err(e) = semaphore.post() {
            warn!(
                name = %semaphore.name(),
                index = self.index,
                "Failed to post event semaphore: {e}"
            );
        }
    }

    fn flag(&self) -> Option<&AtomicBool> {
        let index = usize::try_from(self.index).ok()?;
        self.data.notification(index)
    }

    fn open_semaphore(&self) -> Option<NamedSemaphore> {
        let name = self.data.semaphore_name();
        NamedSemaphoreBuilder::new(name)
            .open_mode(OpenMode::OpenExisting)
            .create()
            .inspect_err(|e| warn!(name = %name, "Failed to open event semaphore: {e}"))
            .ok()
    }

    #[cfg(test)]
    fn cached_generation(&self) -> Option<(u64, bool)> {
        self.semaphore
            .lock()
            .as_ref()
            .map(|c| (c.generation, c.semaphore.is_some()))
    }
}

impl std::fmt::Debug for EventNotifier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("semaphore_name", &self.data.semaphore_name())
            .field("index", &self.index)
            .finish()
    }
}

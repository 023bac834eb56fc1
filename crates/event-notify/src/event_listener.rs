use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tracing::info;
use tracing::warn;
use utils::posix::NamedSemaphore;
use utils::posix::NamedSemaphoreBuilder;
use utils::posix::OpenMode;
use utils::posix::SemaphoreError;

use crate::event_variable_data::EventVariableData;

/// Waits for and collects the events raised on an [`EventVariableData`].
///
/// Owns the linked semaphore: it is created when the listener is and removed
/// when the listener is dropped. Raised flags are cleared only here.
pub struct EventListener<'a> {
    data: &'a EventVariableData,
    semaphore: NamedSemaphore,
}

impl<'a> EventListener<'a> {
    pub fn new(data: &'a EventVariableData) -> Result<Self, SemaphoreError> {
        let semaphore = NamedSemaphoreBuilder::new(data.semaphore_name())
            .open_mode(OpenMode::PurgeAndCreate)
            .initial_value(0)
            .create()?;
        let generation = data.attach_listener();
        info!(
            runtime_name = %data.runtime_name(),
            semaphore_name = %semaphore.name(),
            generation,
            "Created event listener"
        );
        Ok(Self { data, semaphore })
    }

    /// Blocks until at least one event is raised and returns the raised
    /// indices in ascending order. Returns an empty list once
    /// [`EventListener::destroy`] was called.
    pub fn wait(&self) -> Result<Vec<u64>, SemaphoreError> {
        self.wait_with(|| self.semaphore.wait().map(|()| true))
    }

    /// Like [`EventListener::wait`] but gives up after `timeout`.
    pub fn timed_wait(&self, timeout: Duration) -> Result<Vec<u64>, SemaphoreError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait();
        };
        self.wait_with(|| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.semaphore.timed_wait(remaining)
        })
    }

    /// Scans, and blocks through `block` while nothing is raised. `block`
    /// returns `false` once it gives up.
    fn wait_with(
        &self,
        mut block: impl FnMut() -> Result<bool, SemaphoreError>,
    ) -> Result<Vec<u64>, SemaphoreError> {
        loop {
            if self.data.to_be_destroyed() {
                return Ok(Vec::new());
            }
            let active = self.try_collect();
            if !active.is_empty() {
                return Ok(active);
            }
            // posts of already collected events wake us up spuriously
            if !block()? {
                return Ok(self.try_collect());
            }
        }
    }

    /// Collects and clears the raised events without blocking.
    pub fn try_collect(&self) -> Vec<u64> {
        self.data
            .notifications()
            .iter()
            .enumerate()
            .filter(|(_, flag)| flag.swap(false, Ordering::AcqRel))
            .map(|(index, _)| index as u64)
            .collect()
    }

    /// Makes a blocked or future `wait` return empty.
    pub fn destroy(&self) {
        self.data.mark_to_be_destroyed();
        if let Err(e) = self.semaphore.post() {
            warn!(name = %self.semaphore.name(), "Failed to wake up event listener: {e}");
        }
    }
}

impl std::fmt::Debug for EventListener<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("data", &self.data)
            .field("semaphore", &self.semaphore)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::event_notifier::EventNotifier;
    use crate::event_variable_data::MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET;

    #[test]
    fn wait_returns_notified_indices() {
        let data = EventVariableData::new("Ferdinand");
        let listener = EventListener::new(&data).unwrap();

        EventNotifier::new(&data, 42).notify();
        EventNotifier::new(&data, 3).notify();
        EventNotifier::new(&data, MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET as u64 - 1).notify();

        assert_eq!(
            listener.wait().unwrap(),
            vec![3, 42, MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET as u64 - 1]
        );
        assert_eq!(listener.try_collect(), Vec::<u64>::new());
    }

    #[test]
    fn collected_events_are_cleared() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();
        let notifier = EventNotifier::new(&data, 5);

        notifier.notify();
        notifier.notify();
        assert_eq!(listener.wait().unwrap(), vec![5]);
        assert!(data
            .notifications()
            .iter()
            .all(|flag| !flag.load(Ordering::Relaxed)));

        // the second post is still pending but carries no new event
        assert_eq!(listener.timed_wait(Duration::from_millis(20)).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn timed_wait_times_out_empty() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();

        let start = Instant::now();
        assert_eq!(listener.timed_wait(Duration::from_millis(50)).unwrap(), Vec::<u64>::new());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn notify_from_another_thread_wakes_listener() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                EventNotifier::new(&data, 9).notify();
            });
            assert_eq!(listener.wait().unwrap(), vec![9]);
        });
    }

    #[test]
    fn destroy_unblocks_waiting_listener() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| listener.wait());
            std::thread::sleep(Duration::from_millis(20));
            listener.destroy();
            assert_eq!(waiter.join().unwrap().unwrap(), Vec::<u64>::new());
        });
        assert!(data.to_be_destroyed());
        assert_eq!(listener.wait().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn semaphore_is_removed_with_listener() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();
        drop(listener);

        let result = NamedSemaphoreBuilder::new(data.semaphore_name())
            .open_mode(OpenMode::OpenExisting)
            .create();
        assert_eq!(result.unwrap_err(), SemaphoreError::NoSemaphoreWithThatNameExists);
    }

    #[test]
    fn failing_semaphore_wait_is_reported() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();

        let result = listener.wait_with(|| Err(SemaphoreError::InvalidSemaphoreHandle));
        assert_eq!(result, Err(SemaphoreError::InvalidSemaphoreHandle));

        // raised events are still handed out before blocking is attempted
        EventNotifier::new(&data, 1).notify();
        let result = listener.wait_with(|| Err(SemaphoreError::InvalidSemaphoreHandle));
        assert_eq!(result, Ok(vec![1]));
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let data = EventVariableData::default();
        let listener = EventListener::new(&data).unwrap();

        EventNotifier::new(&data, 6).notify();
        assert_eq!(listener.timed_wait(Duration::MAX).unwrap(), vec![6]);
    }

    #[test]
    fn notifier_follows_a_replacement_listener() {
        let data = EventVariableData::default();
        let notifier = EventNotifier::new(&data, 11);

        let first = EventListener::new(&data).unwrap();
        notifier.notify();
        assert_eq!(first.wait().unwrap(), vec![11]);
        first.destroy();
        drop(first);

        let second = EventListener::new(&data).unwrap();
        assert!(!data.to_be_destroyed());
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                notifier.notify();
            });

            let start = Instant::now();
            assert_eq!(second.timed_wait(Duration::from_secs(5)).unwrap(), vec![11]);
            assert!(start.elapsed() < Duration::from_secs(2));
        });
    }
}

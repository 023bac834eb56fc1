//! Cross-process event signaling.
//!
//! An [`EventVariableData`] holds one flag per event slot together with the
//! name of the semaphore a waiting [`EventListener`] blocks on. Any number of
//! [`EventNotifier`]s, each bound to one slot, raise their flag and post the
//! semaphore. The listener collects and clears the raised flags.

pub mod event_listener;
pub mod event_notifier;
pub mod event_variable_data;

pub use event_listener::EventListener;
pub use event_notifier::EventNotifier;
pub use event_variable_data::EventVariableData;
pub use event_variable_data::MAX_NUMBER_OF_EVENTS_PER_ACTIVE_CALL_SET;
pub use event_variable_data::MAX_RUNTIME_NAME_LENGTH;

//! Per-worker event loop.
//!
//! A [`Dispatcher`] owns one mio poll instance and runs all I/O callbacks,
//! timers, and signal handlers for a single worker thread. Foreign threads
//! hand work to the loop through [`DispatcherHandle::post`]; objects whose
//! destructor must not run while their own callback is on the stack are
//! destroyed through [`Dispatcher::deferred_delete`].

mod dispatcher;
mod file_event;
mod signal;
mod timer;

pub use dispatcher::{Dispatcher, DispatcherHandle, RunType};
pub use file_event::{FileEvent, FileReadyType, TriggerType};
pub use signal::SignalEvent;
pub use timer::Timer;

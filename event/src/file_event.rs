//! File readiness events.

use crate::dispatcher::Inner;
use std::os::unix::io::RawFd;
use std::rc::Weak;

/// Readiness bits a file event can request and receive.
pub struct FileReadyType;

impl FileReadyType {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    /// Remote end closed. Delivered together with READ on most platforms.
    pub const CLOSED: u32 = 0x4;
}

/// How readiness is delivered.
///
/// The poller is edge-triggered. `Level` registrations re-deliver the last
/// observed readiness on every loop iteration until the event is disabled or
/// re-armed, so callers must consume or disable to make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Edge,
    Level,
}

/// Handle to a registered file event. Deregisters on drop.
pub struct FileEvent {
    pub(crate) inner: Weak<Inner>,
    pub(crate) key: usize,
    pub(crate) fd: RawFd,
}

impl FileEvent {
    /// Synthesize readiness. The callback runs on the next loop iteration.
    pub fn activate(&self, events: u32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.activate_file(self.key, events);
        }
    }

    /// Change the requested event mask. A mask of zero disables delivery.
    pub fn set_enabled(&self, events: u32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set_file_enabled(self.key, self.fd, events);
        }
    }
}

impl Drop for FileEvent {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_file(self.key, self.fd);
        }
    }
}

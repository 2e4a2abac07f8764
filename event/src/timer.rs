//! One-shot timers.

use crate::dispatcher::Inner;
use std::rc::Weak;
use std::time::Duration;

/// Handle to a dispatcher timer. One-shot; re-arm from the callback for
/// periodic behavior. Cancelled on drop.
pub struct Timer {
    pub(crate) inner: Weak<Inner>,
    pub(crate) key: usize,
}

impl Timer {
    /// Arm (or re-arm) the timer to fire once after `duration`.
    pub fn enable(&self, duration: Duration) {
        if let Some(inner) = self.inner.upgrade() {
            inner.enable_timer(self.key, duration);
        }
    }

    /// Disarm the timer. The callback will not fire until re-enabled.
    pub fn disable(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.disable_timer(self.key);
        }
    }

    /// Whether the timer is currently armed.
    pub fn enabled(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.timer_enabled(self.key))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_timer(self.key);
        }
    }
}

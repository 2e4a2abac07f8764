//! Signal delivery into the event loop.
//!
//! Uses the self-pipe trick: the async-signal handler writes one byte to a
//! non-blocking pipe and the dispatcher watches the read end.

use crate::dispatcher::Dispatcher;
use crate::file_event::{FileEvent, FileReadyType, TriggerType};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

const MAX_SIGNUM: usize = 64;

// Write ends of the per-signal pipes, indexed by signal number. -1 = unused.
static SIGNAL_PIPES: [AtomicI32; MAX_SIGNUM] = [const { AtomicI32::new(-1) }; MAX_SIGNUM];

extern "C" fn pipe_signal_handler(signum: libc::c_int) {
    let fd = SIGNAL_PIPES[signum as usize].load(Ordering::Relaxed);
    if fd >= 0 {
        // write(2) is async-signal-safe. A full pipe just coalesces.
        unsafe {
            libc::write(fd, b"s".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Handle to a registered signal callback. Restores the default disposition
/// on drop.
pub struct SignalEvent {
    _file_event: FileEvent,
    signum: i32,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalEvent {
    pub(crate) fn new(dispatcher: &Dispatcher, signum: i32, mut cb: impl FnMut() + 'static) -> Self {
        assert!((signum as usize) < MAX_SIGNUM, "signal number out of range");

        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert!(rc == 0, "event registration failed: pipe2");
        let (read_fd, write_fd) = (fds[0], fds[1]);

        SIGNAL_PIPES[signum as usize].store(write_fd, Ordering::Relaxed);

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = pipe_signal_handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_RESTART;
            let rc = libc::sigaction(signum, &action, std::ptr::null_mut());
            assert!(rc == 0, "event registration failed: sigaction");
        }

        let file_event = dispatcher.create_file_event(
            read_fd,
            move |_events| {
                let mut buf = [0u8; 64];
                while unsafe {
                    libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                } > 0
                {}
                cb();
            },
            TriggerType::Edge,
            FileReadyType::READ,
        );

        SignalEvent {
            _file_event: file_event,
            signum,
            read_fd,
            write_fd,
        }
    }
}

impl Drop for SignalEvent {
    fn drop(&mut self) {
        unsafe {
            libc::signal(self.signum, libc::SIG_DFL);
        }
        SIGNAL_PIPES[self.signum as usize].store(-1, Ordering::Relaxed);
        unsafe {
            libc::close(self.write_fd);
            libc::close(self.read_fd);
        }
    }
}

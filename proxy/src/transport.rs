//! Byte transport between a connection and its socket.
//!
//! Connections read and write through this seam so TLS can slot in without
//! the connection state machine knowing. The plain transport is direct
//! syscalls; encrypted transports come from an [`crate::ssl`] context.

use std::io;
use std::os::unix::io::RawFd;

pub trait Transport {
    /// Read into `buf`. `Ok(0)` is end of stream; `WouldBlock` means try
    /// again on the next readiness event.
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `data`, returning bytes accepted.
    fn write(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize>;
}

/// Cleartext transport.
#[derive(Default)]
pub struct PlainTransport;

impl Transport for PlainTransport {
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn write(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

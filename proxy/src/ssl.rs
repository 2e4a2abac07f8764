//! TLS context interfaces.
//!
//! The TLS library bindings live outside this repository; these traits are
//! the seam they plug into. A context wraps an established fd into a
//! [`Transport`] that performs the handshake and record layer.

use crate::transport::Transport;
use std::os::unix::io::RawFd;

/// Server-side (terminating) TLS context.
pub trait ServerContext {
    fn new_transport(&self, fd: RawFd) -> Box<dyn Transport>;
}

/// Client-side (originating) TLS context.
pub trait ClientContext {
    fn new_transport(&self, fd: RawFd) -> Box<dyn Transport>;
}

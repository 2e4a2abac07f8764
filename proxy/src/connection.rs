//! Connection state machine.
//!
//! A connection owns one socket fd, buffers reads and writes through its
//! transport, and feeds arriving bytes to a read filter chain. All callbacks
//! run on the owning dispatcher thread; event callbacks are never invoked
//! while the connection's own state is borrowed, so a callback may freely
//! call back into the connection.

use crate::address::Address;
use crate::transport::{PlainTransport, Transport};
use bytes::BytesMut;
use event::{Dispatcher, FileEvent, FileReadyType, TriggerType};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 16384;
const DEFAULT_READ_BUFFER_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Peer finished writing; we may still flush.
    HalfClosedRead,
    /// Local close requested with a flush still pending.
    HalfClosedWrite,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseType {
    /// Flush pending write data, then close.
    FlushWrite,
    /// Close immediately, discarding buffered writes.
    NoFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Outbound connect completed.
    Connected,
    RemoteClose,
    LocalClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// Network-level read filter. Filters own whatever protocol state they need
/// and drain the bytes they consume from the buffer.
pub trait ReadFilter {
    fn on_new_connection(&mut self) -> FilterStatus {
        FilterStatus::Continue
    }

    fn on_data(&mut self, data: &mut BytesMut) -> FilterStatus;
}

/// Installs a connection's filter chain. Returning `false` means no filters
/// were added and the connection should be closed.
pub trait FilterChainFactory {
    fn create_filter_chain(&self, connection: &Connection) -> bool;
}

struct ConnectionInner {
    fd: RawFd,
    fd_open: bool,
    connecting: bool,
    closed: bool,
    read_half_closed: bool,
    close_after_flush: bool,
    read_enabled: bool,
    dispatching_events: bool,
    local_address: Address,
    remote_address: Address,
    transport: Box<dyn Transport>,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    read_buffer_limit: usize,
    read_filters: Vec<Box<dyn ReadFilter>>,
    callbacks: Vec<Box<dyn FnMut(ConnectionEvent)>>,
    pending_events: VecDeque<ConnectionEvent>,
    file_event: Option<FileEvent>,
    bytes_received: u64,
    bytes_sent: u64,
}

impl ConnectionInner {
    fn close_socket(&mut self) {
        if !self.fd_open {
            return;
        }
        // Dropping the file event deregisters before the fd goes away.
        self.file_event = None;
        unsafe {
            libc::close(self.fd);
        }
        self.fd_open = false;
        self.closed = true;
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close_socket();
    }
}

/// Cloneable handle to a connection. The connection lives as long as any
/// handle (or its registered file event closure) does.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnectionInner>>,
}

/// Non-owning connection handle for cross-references between peered
/// connections; ownership stays hierarchical.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<RefCell<ConnectionInner>>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Wrap an accepted socket.
    pub fn new_accepted(
        dispatcher: &Dispatcher,
        fd: RawFd,
        remote_address: Address,
        local_address: Address,
        transport: Box<dyn Transport>,
    ) -> Connection {
        Self::create(dispatcher, fd, remote_address, local_address, transport, false)
    }

    /// Begin a non-blocking connect to `address`. The `Connected` (or
    /// `RemoteClose`) event reports the outcome.
    pub fn connect(dispatcher: &Dispatcher, address: Address) -> io::Result<Connection> {
        Self::connect_with_transport(dispatcher, address, Box::new(PlainTransport))
    }

    pub fn connect_with_transport(
        dispatcher: &Dispatcher,
        address: Address,
        transport: Box<dyn Transport>,
    ) -> io::Result<Connection> {
        let domain = match address.socket_addr() {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&address.socket_addr().into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        let fd = socket.into_raw_fd();
        let placeholder = Address::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Ok(Self::create(dispatcher, fd, address, placeholder, transport, true))
    }

    fn create(
        dispatcher: &Dispatcher,
        fd: RawFd,
        remote_address: Address,
        local_address: Address,
        transport: Box<dyn Transport>,
        connecting: bool,
    ) -> Connection {
        let inner = Rc::new(RefCell::new(ConnectionInner {
            fd,
            fd_open: true,
            connecting,
            closed: false,
            read_half_closed: false,
            close_after_flush: false,
            read_enabled: true,
            dispatching_events: false,
            local_address,
            remote_address,
            transport,
            read_buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            write_buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            read_buffer_limit: DEFAULT_READ_BUFFER_LIMIT,
            read_filters: Vec::new(),
            callbacks: Vec::new(),
            pending_events: VecDeque::new(),
            file_event: None,
            bytes_received: 0,
            bytes_sent: 0,
        }));

        let weak = Rc::downgrade(&inner);
        let file_event = dispatcher.create_file_event(
            fd,
            move |mask| {
                if let Some(inner) = weak.upgrade() {
                    on_socket_event(&inner, mask);
                }
            },
            TriggerType::Edge,
            FileReadyType::READ | FileReadyType::WRITE | FileReadyType::CLOSED,
        );
        inner.borrow_mut().file_event = Some(file_event);

        Connection { inner }
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.borrow();
        if inner.closed {
            ConnectionState::Closed
        } else if inner.read_half_closed {
            ConnectionState::HalfClosedRead
        } else if inner.close_after_flush {
            ConnectionState::HalfClosedWrite
        } else {
            ConnectionState::Open
        }
    }

    pub fn local_address(&self) -> Address {
        self.inner.borrow().local_address
    }

    pub fn remote_address(&self) -> Address {
        self.inner.borrow().remote_address
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.borrow().bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.borrow().bytes_sent
    }

    pub fn buffered_read_bytes(&self) -> usize {
        self.inner.borrow().read_buffer.len()
    }

    pub fn buffered_write_bytes(&self) -> usize {
        self.inner.borrow().write_buffer.len()
    }

    pub fn set_read_buffer_limit(&self, limit: usize) {
        self.inner.borrow_mut().read_buffer_limit = limit;
    }

    pub fn add_read_filter(&self, filter: Box<dyn ReadFilter>) {
        self.inner.borrow_mut().read_filters.push(filter);
    }

    pub fn has_read_filters(&self) -> bool {
        !self.inner.borrow().read_filters.is_empty()
    }

    pub fn add_connection_callbacks(&self, cb: impl FnMut(ConnectionEvent) + 'static) {
        self.inner.borrow_mut().callbacks.push(Box::new(cb));
    }

    pub fn no_delay(&self, enable: bool) {
        let inner = self.inner.borrow();
        if !inner.fd_open {
            return;
        }
        let value: libc::c_int = enable as libc::c_int;
        unsafe {
            libc::setsockopt(
                inner.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    /// Stop (or resume) pulling bytes off the socket. Buffered data is
    /// re-dispatched to the filters on resume.
    pub fn read_disable(&self, disable: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.read_enabled = !disable;
        }
        if !disable {
            let inner = self.inner.borrow();
            if let Some(event) = &inner.file_event {
                event.activate(FileReadyType::READ);
            }
        }
    }

    /// Queue `data` and flush as much as the socket accepts.
    pub fn write(&self, data: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.close_after_flush {
                return;
            }
            inner.write_buffer.extend_from_slice(data);
        }
        on_writable(&self.inner);
    }

    pub fn close(&self, close_type: ConnectionCloseType) {
        let raise;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            match close_type {
                ConnectionCloseType::NoFlush => {
                    inner.close_socket();
                    raise = true;
                }
                ConnectionCloseType::FlushWrite => {
                    if inner.write_buffer.is_empty() || inner.connecting {
                        inner.close_socket();
                        raise = true;
                    } else {
                        trace!(fd = inner.fd, "close deferred until write buffer drains");
                        inner.close_after_flush = true;
                        inner.read_enabled = false;
                        raise = false;
                    }
                }
            }
        }
        if raise {
            raise_event(&self.inner, ConnectionEvent::LocalClose);
        }
    }

    /// Run `on_new_connection` through the filter chain. Called once by the
    /// owner after the chain is installed.
    pub fn initialize_read_filters(&self) {
        let mut filters = std::mem::take(&mut self.inner.borrow_mut().read_filters);
        for filter in &mut filters {
            if filter.on_new_connection() == FilterStatus::StopIteration {
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        let added = std::mem::take(&mut inner.read_filters);
        filters.extend(added);
        inner.read_filters = filters;
    }
}

fn on_socket_event(inner_rc: &Rc<RefCell<ConnectionInner>>, mask: u32) {
    // Resolve a pending connect first: write readiness reports the outcome.
    let connect_result = {
        let mut inner = inner_rc.borrow_mut();
        if inner.closed || !inner.connecting {
            None
        } else if mask & (FileReadyType::WRITE | FileReadyType::CLOSED) != 0 {
            let error = socket_error(inner.fd);
            if error == 0 {
                inner.connecting = false;
                inner.local_address = local_socket_address(inner.fd);
                Some(ConnectionEvent::Connected)
            } else {
                debug!(
                    fd = inner.fd,
                    error = %io::Error::from_raw_os_error(error),
                    "connect failed"
                );
                inner.close_socket();
                Some(ConnectionEvent::RemoteClose)
            }
        } else {
            None
        }
    };

    match connect_result {
        Some(event @ ConnectionEvent::RemoteClose) => {
            raise_event(inner_rc, event);
            return;
        }
        Some(event @ ConnectionEvent::Connected) => {
            raise_event(inner_rc, event);
        }
        _ => {}
    }

    if mask & FileReadyType::WRITE != 0 {
        on_writable(inner_rc);
    }
    if mask & (FileReadyType::READ | FileReadyType::CLOSED) != 0 {
        on_readable(inner_rc);
    }
}

fn on_writable(inner_rc: &Rc<RefCell<ConnectionInner>>) {
    let raise = {
        let mut inner = inner_rc.borrow_mut();
        if inner.closed || inner.connecting {
            return;
        }

        let mut write_error = None;
        while !inner.write_buffer.is_empty() {
            let ConnectionInner {
                transport,
                fd,
                write_buffer,
                bytes_sent,
                ..
            } = &mut *inner;
            match transport.write(*fd, write_buffer) {
                Ok(0) => break,
                Ok(n) => {
                    *bytes_sent += n as u64;
                    let _ = write_buffer.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    write_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = write_error {
            debug!(fd = inner.fd, error = %e, "write error");
            inner.close_socket();
            Some(ConnectionEvent::RemoteClose)
        } else if inner.close_after_flush && inner.write_buffer.is_empty() {
            inner.close_socket();
            Some(ConnectionEvent::LocalClose)
        } else {
            None
        }
    };

    if let Some(event) = raise {
        raise_event(inner_rc, event);
    }
}

fn on_readable(inner_rc: &Rc<RefCell<ConnectionInner>>) {
    let (got_data, terminal) = {
        let mut inner = inner_rc.borrow_mut();
        if inner.closed || inner.connecting || !inner.read_enabled {
            return;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut got_data = false;
        let mut saw_eof = false;
        let mut read_error = None;
        loop {
            if inner.read_buffer.len() >= inner.read_buffer_limit {
                // Backpressure: leave the rest in the socket buffer.
                break;
            }
            let ConnectionInner {
                transport,
                fd,
                read_buffer,
                bytes_received,
                ..
            } = &mut *inner;
            match transport.read(*fd, &mut chunk) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => {
                    *bytes_received += n as u64;
                    read_buffer.extend_from_slice(&chunk[..n]);
                    got_data = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }

        let mut terminal = None;
        if saw_eof {
            inner.read_half_closed = true;
            terminal = Some(ConnectionEvent::RemoteClose);
        } else if let Some(e) = read_error {
            debug!(fd = inner.fd, error = %e, "read error");
            terminal = Some(ConnectionEvent::RemoteClose);
        }
        if terminal.is_some() {
            inner.close_socket();
        }
        (got_data, terminal)
    };

    if got_data {
        run_read_filters(inner_rc);
    }
    if let Some(event) = terminal {
        raise_event(inner_rc, event);
    }
}

fn run_read_filters(inner_rc: &Rc<RefCell<ConnectionInner>>) {
    // Filters and the buffer come out of the connection while they run so a
    // filter can call write/close/read_disable on its own connection.
    let (mut filters, mut buffer) = {
        let mut inner = inner_rc.borrow_mut();
        (
            std::mem::take(&mut inner.read_filters),
            std::mem::take(&mut inner.read_buffer),
        )
    };

    for filter in &mut filters {
        if buffer.is_empty() {
            break;
        }
        if filter.on_data(&mut buffer) == FilterStatus::StopIteration {
            break;
        }
    }

    let mut inner = inner_rc.borrow_mut();
    let added = std::mem::take(&mut inner.read_filters);
    filters.extend(added);
    inner.read_filters = filters;
    inner.read_buffer = buffer;
}

fn raise_event(inner_rc: &Rc<RefCell<ConnectionInner>>, event: ConnectionEvent) {
    {
        let mut inner = inner_rc.borrow_mut();
        inner.pending_events.push_back(event);
        if inner.dispatching_events {
            // The active dispatch loop will pick it up.
            return;
        }
        inner.dispatching_events = true;
    }

    loop {
        let Some(event) = inner_rc.borrow_mut().pending_events.pop_front() else {
            break;
        };
        let mut callbacks = std::mem::take(&mut inner_rc.borrow_mut().callbacks);
        for cb in &mut callbacks {
            cb(event);
        }
        let mut inner = inner_rc.borrow_mut();
        let added = std::mem::take(&mut inner.callbacks);
        callbacks.extend(added);
        inner.callbacks = callbacks;
    }

    inner_rc.borrow_mut().dispatching_events = false;
}

fn socket_error(fd: RawFd) -> i32 {
    let mut error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 { libc::EBADF } else { error }
}

fn local_socket_address(fd: RawFd) -> Address {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc == 0
        && let Some(addr) = sockaddr_to_std(&storage)
    {
        return Address::new(addr);
    }
    Address::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

/// Convert a populated `sockaddr_storage` to a std address.
pub(crate) fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let v4 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(v4.sin_port))))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(v6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(v6.sin6_port))))
        }
        _ => None,
    }
}

//! Listeners: accept sockets and deliver connections.

use crate::address::Address;
use crate::connection::{Connection, sockaddr_to_std};
use crate::proxy_proto::ProxyProtocol;
use crate::ssl;
use crate::transport::PlainTransport;
use event::{Dispatcher, FileEvent, FileReadyType, TriggerType};
use stats::{Counter, Store};
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, error, trace};

const LISTEN_BACKLOG: i32 = 4096;

/// Per-listener behavior flags.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Accept on the socket. Off for listeners that only receive redirected
    /// connections.
    pub bind_to_port: bool,
    /// Strip a PROXY protocol header before any filter sees bytes.
    pub use_proxy_proto: bool,
    /// Resolve the pre-DNAT destination and hand off to the listener bound
    /// there.
    pub use_original_dst: bool,
    pub per_connection_buffer_limit: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        ListenerOptions {
            bind_to_port: true,
            use_proxy_proto: false,
            use_original_dst: false,
            per_connection_buffer_limit: 1024 * 1024,
        }
    }
}

/// Receives accepted connections from a listener.
pub trait ListenerCallbacks {
    fn on_new_connection(&self, connection: Connection);
}

/// A bound, listening socket. Shared by every worker's listener and kept
/// open for hot-restart handoff.
pub struct ListenSocket {
    fd: OwnedFd,
    local_address: Address,
}

impl ListenSocket {
    /// Create, bind, and listen.
    pub fn bind(address: Address) -> io::Result<ListenSocket> {
        let domain = match address.socket_addr() {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.socket_addr().into())?;
        socket.listen(LISTEN_BACKLOG)?;

        // Re-read the local address so port 0 resolves.
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listen socket has no inet address"))?;
        Ok(ListenSocket {
            fd: unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) },
            local_address: Address::new(local),
        })
    }

    /// Adopt an already-listening fd, e.g. one duplicated from the previous
    /// process generation.
    pub fn from_fd(fd: OwnedFd) -> io::Result<ListenSocket> {
        let socket = unsafe { socket2::Socket::from_raw_fd(fd.into_raw_fd()) };
        socket.set_nonblocking(true)?;
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listen socket has no inet address"))?;
        Ok(ListenSocket {
            fd: unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) },
            local_address: Address::new(local),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn local_address(&self) -> Address {
        self.local_address
    }
}

type RedirectLookup = dyn Fn(Address) -> Option<Listener>;
type OriginalDstLookup = dyn Fn(RawFd) -> Option<Address>;

struct ListenerInner {
    dispatcher: Rc<Dispatcher>,
    socket: Arc<ListenSocket>,
    callbacks: Rc<dyn ListenerCallbacks>,
    ssl_ctx: Option<Rc<dyn ssl::ServerContext>>,
    options: ListenerOptions,
    proxy_protocol: ProxyProtocol,
    accept_error: Counter,
    // Set by the connection handler so redirected fds can reach a sibling.
    redirect_lookup: RefCell<Option<Rc<RedirectLookup>>>,
    original_dst_lookup: RefCell<Rc<OriginalDstLookup>>,
    accept_event: RefCell<Option<FileEvent>>,
}

/// One listening endpoint on a worker. Dropping the handle (and every clone)
/// stops accepting; the underlying socket stays open for handoff.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Listener {
    pub fn new(
        dispatcher: &Rc<Dispatcher>,
        socket: Arc<ListenSocket>,
        callbacks: Rc<dyn ListenerCallbacks>,
        store: &Store,
        options: ListenerOptions,
    ) -> Listener {
        Self::create(dispatcher, socket, callbacks, None, store, options)
    }

    pub fn new_ssl(
        dispatcher: &Rc<Dispatcher>,
        ssl_ctx: Rc<dyn ssl::ServerContext>,
        socket: Arc<ListenSocket>,
        callbacks: Rc<dyn ListenerCallbacks>,
        store: &Store,
        options: ListenerOptions,
    ) -> Listener {
        Self::create(dispatcher, socket, callbacks, Some(ssl_ctx), store, options)
    }

    fn create(
        dispatcher: &Rc<Dispatcher>,
        socket: Arc<ListenSocket>,
        callbacks: Rc<dyn ListenerCallbacks>,
        ssl_ctx: Option<Rc<dyn ssl::ServerContext>>,
        store: &Store,
        options: ListenerOptions,
    ) -> Listener {
        let inner = Rc::new(ListenerInner {
            dispatcher: dispatcher.clone(),
            socket,
            callbacks,
            ssl_ctx,
            options,
            proxy_protocol: ProxyProtocol::new(store.counter("downstream_cx_proxy_proto_error")),
            accept_error: store.counter("downstream_cx_accept_error"),
            redirect_lookup: RefCell::new(None),
            original_dst_lookup: RefCell::new(Rc::new(original_dst_from_socket)),
            accept_event: RefCell::new(None),
        });

        if inner.options.bind_to_port {
            let weak = Rc::downgrade(&inner);
            let event = inner.dispatcher.create_file_event(
                inner.socket.fd(),
                move |_events| {
                    if let Some(inner) = weak.upgrade() {
                        on_accept_ready(&inner);
                    }
                },
                TriggerType::Edge,
                FileReadyType::READ,
            );
            *inner.accept_event.borrow_mut() = Some(event);
        }

        Listener { inner }
    }

    pub fn local_address(&self) -> Address {
        self.inner.socket.local_address()
    }

    /// Install the sibling-listener lookup used for original-destination
    /// redirects.
    pub fn set_redirect_lookup(&self, lookup: Rc<RedirectLookup>) {
        *self.inner.redirect_lookup.borrow_mut() = Some(lookup);
    }

    /// Replace the original-destination resolver. The default queries the
    /// OS for the pre-DNAT address.
    pub fn set_original_dst_lookup(&self, lookup: Rc<OriginalDstLookup>) {
        *self.inner.original_dst_lookup.borrow_mut() = lookup;
    }

    /// Deliver an fd accepted (and possibly redirected) elsewhere.
    pub fn inject_connection(&self, fd: RawFd, remote_address: Address, local_address: Address) {
        dispatch_socket(&self.inner, fd, remote_address, local_address);
    }
}

fn on_accept_ready(inner: &Rc<ListenerInner>) {
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                inner.socket.fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::ECONNABORTED) | Some(libc::EINTR) => continue,
                _ => {
                    // Out of fds or memory; there is no way to make forward
                    // progress.
                    inner.accept_error.inc();
                    error!(address = %inner.socket.local_address(), error = %e, "accept failed");
                    panic!("listener accept failure: {}", e);
                }
            }
        }

        let remote_address = sockaddr_to_std(&storage)
            .map(Address::new)
            .unwrap_or_else(|| Address::new(SocketAddr::from(([0, 0, 0, 0], 0))));
        handle_new_socket(inner, fd, remote_address);
    }
}

fn handle_new_socket(inner: &Rc<ListenerInner>, fd: RawFd, remote_address: Address) {
    let mut local_address = inner.socket.local_address();

    if inner.options.use_original_dst {
        let lookup = inner.original_dst_lookup.borrow().clone();
        if let Some(original_dst) = lookup(fd)
            && original_dst != local_address
        {
            // Redirected by the front end (e.g. iptables). Hand off to the
            // listener bound to the original destination when one exists;
            // otherwise handle it here under that address.
            let sibling = inner
                .redirect_lookup
                .borrow()
                .as_ref()
                .and_then(|find| find(original_dst));
            if let Some(sibling) = sibling
                && !Rc::ptr_eq(&sibling.inner, inner)
            {
                trace!(
                    original_dst = %original_dst,
                    "redirecting connection to sibling listener"
                );
                sibling.inject_connection(fd, remote_address, original_dst);
                return;
            }
            local_address = original_dst;
        }
    }

    dispatch_socket(inner, fd, remote_address, local_address);
}

fn dispatch_socket(inner: &Rc<ListenerInner>, fd: RawFd, remote_address: Address, local_address: Address) {
    if inner.options.use_proxy_proto {
        let inner2 = inner.clone();
        inner.proxy_protocol.new_connection(
            &inner.dispatcher,
            fd,
            Box::new(move |fd, header_remote| {
                let remote = header_remote.unwrap_or(remote_address);
                new_connection(&inner2, fd, remote, local_address);
            }),
        );
    } else {
        new_connection(inner, fd, remote_address, local_address);
    }
}

fn new_connection(inner: &Rc<ListenerInner>, fd: RawFd, remote_address: Address, local_address: Address) {
    let transport = match &inner.ssl_ctx {
        Some(ctx) => ctx.new_transport(fd),
        None => Box::new(PlainTransport),
    };
    let connection =
        Connection::new_accepted(&inner.dispatcher, fd, remote_address, local_address, transport);
    connection.set_read_buffer_limit(inner.options.per_connection_buffer_limit);
    debug!(remote = %remote_address, local = %local_address, "new connection");
    inner.callbacks.on_new_connection(connection);
}

/// Query the OS for the pre-DNAT destination of a redirected socket.
#[cfg(target_os = "linux")]
fn original_dst_from_socket(fd: RawFd) -> Option<Address> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    sockaddr_to_std(&storage).map(Address::new)
}

#[cfg(not(target_os = "linux"))]
fn original_dst_from_socket(_fd: RawFd) -> Option<Address> {
    None
}

//! The hot-restart coordinator.

use crate::rpc::{MAX_RPC_SIZE, RpcError, RpcMessage};
use crate::shmem::{Error, NUM_STAT_SLOTS, ProcessSharedMutex, SharedMemoryHandle};
use event::{Dispatcher, FileEvent, FileReadyType, TriggerType};
use stats::{StatDataAllocator, StatRef};
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

/// At most this many generations run concurrently; a fourth start addresses
/// (and replaces) the oldest.
pub const MAX_CONCURRENT_PROCESSES: u32 = 3;

/// Ancillary-data buffer for sendmsg/recvmsg, aligned so the kernel-written
/// `cmsghdr` inside it can be dereferenced directly.
#[repr(align(8))]
struct CmsgBuf([u8; 64]);

/// Stats the parent reports over GetStatsRequest.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentStats {
    pub memory_allocated: u64,
    pub num_connections: u64,
}

/// What the parent side of the RPC needs from the running server.
pub trait HotRestartServer {
    /// Raw fd of the listener bound to `address`, if any. The fd stays
    /// owned by the server; the RPC layer duplicates it into the control
    /// message.
    fn listen_socket_fd(&self, address: &str) -> Option<RawFd>;
    fn drain_listeners(&self);
    fn shutdown_admin(&self);
    fn original_start_time(&self) -> u64;
    fn stats_snapshot(&self) -> ParentStats;
}

type SocketAddress = (libc::sockaddr_un, libc::socklen_t);

/// Parent/child IPC plus the shared stat region for one process generation.
pub struct HotRestart {
    restart_epoch: u32,
    shmem: Arc<SharedMemoryHandle>,
    my_socket: OwnedFd,
    parent_address: Option<SocketAddress>,
    child_address: SocketAddress,
    parent_terminated: Cell<bool>,
    server: RefCell<Option<Rc<dyn HotRestartServer>>>,
    socket_event: RefCell<Option<FileEvent>>,
}

impl HotRestart {
    pub fn new(base_id: u32, restart_epoch: u32) -> Result<HotRestart, Error> {
        let shmem = Arc::new(SharedMemoryHandle::initialize(base_id, restart_epoch)?);

        let my_socket = bind_domain_socket(base_id, restart_epoch)?;
        let child_address = domain_socket_address(base_id, restart_epoch + 1);
        let parent_address =
            (restart_epoch != 0).then(|| domain_socket_address(base_id, restart_epoch - 1));

        // If our parent ever goes away, terminate: a generation should never
        // outlive the process that launched it.
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong, 0, 0, 0);
        }

        Ok(HotRestart {
            restart_epoch,
            shmem,
            my_socket,
            parent_address,
            child_address,
            parent_terminated: Cell::new(false),
            server: RefCell::new(None),
            socket_event: RefCell::new(None),
        })
    }

    pub fn restart_epoch(&self) -> u32 {
        self.restart_epoch
    }

    pub fn version(&self) -> String {
        self.shmem.version_string()
    }

    pub fn log_lock(&self) -> ProcessSharedMutex {
        self.shmem.log_lock()
    }

    pub fn access_log_lock(&self) -> ProcessSharedMutex {
        self.shmem.access_log_lock()
    }

    /// Allocator backed by the region's stat slots. Stats allocated through
    /// it are visible to, and inherited by, other generations.
    pub fn stat_allocator(&self) -> SharedStatAllocator {
        SharedStatAllocator {
            shmem: self.shmem.clone(),
        }
    }

    pub fn shared_memory(&self) -> &Arc<SharedMemoryHandle> {
        &self.shmem
    }

    /// Register the RPC socket with the main dispatcher and start serving
    /// requests from the next generation.
    pub fn initialize(self: Rc<Self>, dispatcher: &Dispatcher, server: Rc<dyn HotRestartServer>) {
        *self.server.borrow_mut() = Some(server);
        let weak = Rc::downgrade(&self);
        let event = dispatcher.create_file_event(
            self.my_socket.as_raw_fd(),
            move |_events| {
                if let Some(hot_restart) = weak.upgrade() {
                    hot_restart.process_pending_rpcs();
                }
            },
            TriggerType::Edge,
            FileReadyType::READ,
        );
        *self.socket_event.borrow_mut() = Some(event);
    }

    /// Tell the parent to stop accepting new connections. No reply.
    pub fn drain_parent_listeners(&self) {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return;
        }
        self.send_to_parent(&RpcMessage::DrainListenersRequest, None);
    }

    /// Ask the parent for a copy of its listen socket bound to `address`.
    pub fn duplicate_parent_listen_socket(&self, address: &str) -> Option<OwnedFd> {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return None;
        }

        self.send_to_parent(
            &RpcMessage::GetListenSocketRequest {
                address: address.to_string(),
            },
            None,
        );
        let (msg, fd) = self.receive_reply();
        match msg {
            RpcMessage::GetListenSocketReply { fd_present: true } => {
                debug_assert!(fd.is_some());
                fd
            }
            RpcMessage::GetListenSocketReply { fd_present: false } => None,
            other => panic!("unexpected hot restart reply: {:?}", other),
        }
    }

    /// Snapshot of the parent's stats, zeros when there is no parent.
    pub fn get_parent_stats(&self) -> ParentStats {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return ParentStats::default();
        }

        self.send_to_parent(&RpcMessage::GetStatsRequest, None);
        match self.receive_reply().0 {
            RpcMessage::GetStatsReply {
                memory_allocated,
                num_connections,
            } => ParentStats {
                memory_allocated,
                num_connections,
            },
            other => panic!("unexpected hot restart reply: {:?}", other),
        }
    }

    /// Shut down the parent's admin surface; returns the start time of the
    /// first generation so uptime survives restarts.
    pub fn shutdown_parent_admin(&self) -> Option<u64> {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return None;
        }

        self.send_to_parent(&RpcMessage::ShutdownAdminRequest, None);
        match self.receive_reply().0 {
            RpcMessage::ShutdownAdminReply {
                original_start_time,
            } => Some(original_start_time),
            other => panic!("unexpected hot restart reply: {:?}", other),
        }
    }

    /// Tell the parent to exit. Idempotent.
    pub fn terminate_parent(&self) {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return;
        }
        self.send_to_parent(&RpcMessage::TerminateRequest, None);
        self.parent_terminated.set(true);
    }

    /// Drain and dispatch every queued request. Each request gets exactly
    /// one reply; unknown messages get `UnknownRequestReply`.
    pub fn process_pending_rpcs(&self) {
        loop {
            let Some((msg, _fd)) = self.receive_rpc(false) else {
                return;
            };

            let server = self.server.borrow().clone();
            let Some(server) = server else {
                warn!("hot restart rpc received before initialization");
                self.send_message(&self.child_address, &RpcMessage::UnknownRequestReply, None);
                continue;
            };

            match msg {
                Ok(RpcMessage::ShutdownAdminRequest) => {
                    server.shutdown_admin();
                    self.send_message(
                        &self.child_address,
                        &RpcMessage::ShutdownAdminReply {
                            original_start_time: server.original_start_time(),
                        },
                        None,
                    );
                }
                Ok(RpcMessage::GetListenSocketRequest { address }) => {
                    let fd = server.listen_socket_fd(&address);
                    debug!(address = %address, found = fd.is_some(), "listen socket requested");
                    self.send_message(
                        &self.child_address,
                        &RpcMessage::GetListenSocketReply {
                            fd_present: fd.is_some(),
                        },
                        fd,
                    );
                }
                Ok(RpcMessage::GetStatsRequest) => {
                    let snapshot = server.stats_snapshot();
                    self.send_message(
                        &self.child_address,
                        &RpcMessage::GetStatsReply {
                            memory_allocated: snapshot.memory_allocated,
                            num_connections: snapshot.num_connections,
                        },
                        None,
                    );
                }
                Ok(RpcMessage::DrainListenersRequest) => {
                    server.drain_listeners();
                }
                Ok(RpcMessage::TerminateRequest) => {
                    warn!("shutting down due to child request");
                    unsafe {
                        libc::kill(libc::getpid(), libc::SIGTERM);
                    }
                }
                Ok(other) => {
                    warn!(message = ?other, "unexpected hot restart request");
                    self.send_message(&self.child_address, &RpcMessage::UnknownRequestReply, None);
                }
                Err(e) => {
                    warn!(error = %e, "malformed hot restart request");
                    self.send_message(&self.child_address, &RpcMessage::UnknownRequestReply, None);
                }
            }
        }
    }

    fn send_to_parent(&self, msg: &RpcMessage, fd: Option<RawFd>) {
        let parent = self
            .parent_address
            .as_ref()
            .expect("no parent at epoch zero");
        self.send_message(parent, msg, fd);
    }

    fn send_message(&self, address: &SocketAddress, msg: &RpcMessage, fd: Option<RawFd>) {
        let mut buf = [0u8; MAX_RPC_SIZE];
        let len = msg.encode(&mut buf);

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: len,
        };
        let mut control = CmsgBuf([0u8; 64]);

        unsafe {
            let mut message: libc::msghdr = std::mem::zeroed();
            message.msg_name = &address.0 as *const libc::sockaddr_un as *mut libc::c_void;
            message.msg_namelen = address.1;
            message.msg_iov = &mut iov;
            message.msg_iovlen = 1;

            if let Some(fd) = fd {
                message.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
                message.msg_controllen =
                    libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) as usize;
                let cmsg = libc::CMSG_FIRSTHDR(&message);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as u32) as usize;
                *(libc::CMSG_DATA(cmsg) as *mut libc::c_int) = fd;
            }

            let rc = libc::sendmsg(self.my_socket.as_raw_fd(), &message, 0);
            if rc == -1 {
                panic!(
                    "hot restart sendmsg failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// Block for the parent's reply to a request we just sent.
    fn receive_reply(&self) -> (RpcMessage, Option<OwnedFd>) {
        let (msg, fd) = self
            .receive_rpc(true)
            .expect("blocking receive returned nothing");
        (msg.expect("malformed hot restart reply"), fd)
    }

    fn receive_rpc(&self, block: bool) -> Option<(Result<RpcMessage, RpcError>, Option<OwnedFd>)> {
        let fd = self.my_socket.as_raw_fd();

        // The socket is non-blocking by default; flip it for exactly one
        // recv when awaiting a typed reply.
        if block {
            set_nonblocking(fd, false);
        }

        let mut buf = [0u8; MAX_RPC_SIZE];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = CmsgBuf([0u8; 64]);

        let (rc, received_fd) = unsafe {
            let mut message: libc::msghdr = std::mem::zeroed();
            message.msg_iov = &mut iov;
            message.msg_iovlen = 1;
            // Always set up to receive an fd even though most messages do
            // not carry one.
            message.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
            message.msg_controllen =
                libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) as usize;

            let rc = libc::recvmsg(fd, &mut message, 0);
            if block {
                set_nonblocking(fd, true);
            }
            if rc == -1 {
                let err = std::io::Error::last_os_error();
                if !block && err.kind() == std::io::ErrorKind::WouldBlock {
                    return None;
                }
                panic!("hot restart recvmsg failed: {}", err);
            }

            let mut received_fd = None;
            let mut cmsg = libc::CMSG_FIRSTHDR(&message);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                    received_fd = Some(OwnedFd::from_raw_fd(raw));
                }
                cmsg = libc::CMSG_NXTHDR(&message, cmsg);
            }
            (rc as usize, received_fd)
        };

        Some((RpcMessage::decode(&buf[..rc]), received_fd))
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) {
    let flags = if nonblocking { libc::O_NONBLOCK } else { 0 };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    assert!(rc != -1, "fcntl on hot restart socket failed");
}

fn bind_domain_socket(base_id: u32, epoch: u32) -> Result<OwnedFd, Error> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    assert!(fd != -1, "cannot create hot restart socket");
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let (address, len) = domain_socket_address(base_id, epoch);
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &address as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(Error::BindDomainSocket {
            id: base_id as u64 + (epoch % MAX_CONCURRENT_PROCESSES) as u64,
        });
    }

    Ok(socket)
}

/// Abstract-namespace datagram address for a generation slot.
fn domain_socket_address(base_id: u32, id: u32) -> SocketAddress {
    let slot = id % MAX_CONCURRENT_PROCESSES;
    let name = format!("bloomery_domain_socket_{}", base_id as u64 + slot as u64);

    let mut address: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    address.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // First byte of the path stays zero: abstract namespace, nothing on the
    // filesystem to clean up.
    for (i, b) in name.as_bytes().iter().enumerate() {
        address.sun_path[i + 1] = *b as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + 1 + name.len();
    (address, len as libc::socklen_t)
}

/// Stat allocator over the shared-memory slots. Linear scan under the
/// region's stat lock; counters themselves are updated lock-free.
#[derive(Clone)]
pub struct SharedStatAllocator {
    shmem: Arc<SharedMemoryHandle>,
}

impl StatDataAllocator for SharedStatAllocator {
    fn alloc(&self, name: &str) -> Option<StatRef> {
        let lock = self.shmem.stat_lock();
        let _guard = lock.lock();

        let mut first_free = None;
        for i in 0..NUM_STAT_SLOTS {
            let slot = self.shmem.slot(i);
            unsafe {
                if (*slot).initialized() {
                    if (*slot).matches(name) {
                        (*slot).ref_count += 1;
                        return Some(StatRef::new(NonNull::new_unchecked(slot)));
                    }
                } else if first_free.is_none() {
                    first_free = Some(slot);
                }
            }
        }

        let slot = first_free?;
        unsafe {
            (*slot).initialize(name);
            Some(StatRef::new(NonNull::new_unchecked(slot)))
        }
    }

    fn free(&self, data: StatRef) {
        let lock = self.shmem.stat_lock();
        let _guard = lock.lock();

        // The decrement must happen under the lock: it can race with a
        // matching alloc in another process.
        let raw = data.as_ptr().as_ptr();
        unsafe {
            debug_assert!((*raw).ref_count > 0);
            (*raw).ref_count -= 1;
            if (*raw).ref_count == 0 {
                (*raw).zero();
            }
        }
    }
}

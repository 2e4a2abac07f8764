//! PROXY protocol header probe.
//!
//! A front-end load balancer may prepend a v1 text line or a v2 binary
//! header carrying the real client address. The probe peeks at the socket
//! until a full header is buffered, consumes exactly the header bytes, and
//! hands the fd on with the rewritten remote address; payload bytes stay in
//! the socket for the filter chain. A malformed header closes the fd.

use crate::address::Address;
use event::{Dispatcher, FileEvent, FileReadyType, TriggerType};
use slab::Slab;
use stats::Counter;
use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// v1 lines are at most 107 bytes + CRLF.
const MAX_V1_LINE: usize = 108;

/// v2: 16-byte fixed header plus up to 216 bytes of addresses.
const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\x00\r\nQUIT\n";
const V2_HEADER_SIZE: usize = 16;
const MAX_HEADER_SIZE: usize = V2_HEADER_SIZE + 216;

/// Completion: the fd plus the address from the header (`None` when the
/// header declares an unknown/local peer and the socket address stands).
type ProbeDone = Box<dyn FnOnce(RawFd, Option<Address>)>;

struct Probe {
    fd: RawFd,
    done: Option<ProbeDone>,
    file_event: Option<FileEvent>,
}

impl Drop for Probe {
    fn drop(&mut self) {
        // A probe dropped without completing still owns the fd.
        if self.done.is_some() {
            self.file_event = None;
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

pub(crate) struct ProxyProtocol {
    probes: Rc<RefCell<Slab<Probe>>>,
    error_counter: Counter,
}

impl ProxyProtocol {
    pub fn new(error_counter: Counter) -> ProxyProtocol {
        ProxyProtocol {
            probes: Rc::new(RefCell::new(Slab::new())),
            error_counter,
        }
    }

    /// Begin probing `fd`; `done` fires once the header is stripped.
    pub fn new_connection(&self, dispatcher: &Dispatcher, fd: RawFd, done: ProbeDone) {
        let key = self.probes.borrow_mut().insert(Probe {
            fd,
            done: Some(done),
            file_event: None,
        });

        let probes = self.probes.clone();
        let error_counter = self.error_counter.clone();
        let event = dispatcher.create_file_event(
            fd,
            move |_events| on_probe_readable(&probes, key, &error_counter),
            TriggerType::Edge,
            FileReadyType::READ,
        );

        let mut probes = self.probes.borrow_mut();
        let event_ref = &mut probes[key];
        event_ref.file_event = Some(event);
        // The header may already be buffered; don't wait for a fresh edge.
        if let Some(ev) = &event_ref.file_event {
            ev.activate(FileReadyType::READ);
        }
    }
}

fn on_probe_readable(probes: &Rc<RefCell<Slab<Probe>>>, key: usize, error_counter: &Counter) {
    let fd = {
        let probes = probes.borrow();
        let Some(probe) = probes.get(key) else {
            return;
        };
        probe.fd
    };

    match read_header(fd) {
        Ok(None) => {} // incomplete, wait for more bytes
        Ok(Some(header_remote)) => {
            let mut probe = probes.borrow_mut().remove(key);
            let done = probe.done.take().expect("probe completed twice");
            probe.file_event = None;
            done(fd, header_remote);
        }
        Err(_) => {
            error_counter.inc();
            // Probe::drop closes the fd.
            probes.borrow_mut().remove(key);
        }
    }
}

/// Peek the socket; when a full header is buffered, consume exactly its
/// bytes and return the carried address.
///
/// `Ok(None)` means the header is not complete yet.
fn read_header(fd: RawFd) -> io::Result<Option<Option<Address>>> {
    let mut buf = [0u8; MAX_HEADER_SIZE];
    let peeked = match peek(fd, &mut buf) {
        Ok(0) => return Err(io::Error::other("eof before proxy protocol header")),
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(e),
    };
    let data = &buf[..peeked];

    if data.len() >= V2_SIGNATURE.len() && &data[..V2_SIGNATURE.len()] == V2_SIGNATURE {
        return read_v2_header(fd, data);
    }

    // v1: a text line ending in CRLF within the first 108 bytes.
    let Some(line_end) = find_crlf(&data[..data.len().min(MAX_V1_LINE)]) else {
        if data.len() >= MAX_V1_LINE {
            return Err(io::Error::other("proxy protocol v1 line too long"));
        }
        return Ok(None);
    };

    let header_len = line_end + 2;
    let remote = parse_v1_line(&data[..line_end])?;
    consume(fd, header_len)?;
    Ok(Some(remote))
}

fn read_v2_header(fd: RawFd, data: &[u8]) -> io::Result<Option<Option<Address>>> {
    if data.len() < V2_HEADER_SIZE {
        return Ok(None);
    }

    let ver_cmd = data[12];
    let family = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let total = V2_HEADER_SIZE + addr_len;

    if ver_cmd >> 4 != 2 {
        return Err(io::Error::other("bad proxy protocol v2 version"));
    }
    if total > MAX_HEADER_SIZE {
        return Err(io::Error::other("proxy protocol v2 header too long"));
    }
    if data.len() < total {
        return Ok(None);
    }

    let remote = match (ver_cmd & 0x0f, family) {
        // LOCAL: health checks etc., keep the socket address.
        (0x0, _) => None,
        // PROXY over TCP4
        (0x1, 0x11) => {
            if addr_len < 12 {
                return Err(io::Error::other("short proxy protocol v2 address block"));
            }
            let a = &data[V2_HEADER_SIZE..];
            let ip = IpAddr::from([a[0], a[1], a[2], a[3]]);
            let port = u16::from_be_bytes([a[8], a[9]]);
            Some(Address::new(SocketAddr::new(ip, port)))
        }
        // PROXY over TCP6
        (0x1, 0x21) => {
            if addr_len < 36 {
                return Err(io::Error::other("short proxy protocol v2 address block"));
            }
            let a = &data[V2_HEADER_SIZE..];
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&a[0..16]);
            let port = u16::from_be_bytes([a[32], a[33]]);
            Some(Address::new(SocketAddr::new(IpAddr::from(ip), port)))
        }
        _ => return Err(io::Error::other("unsupported proxy protocol v2 family")),
    };

    consume(fd, total)?;
    Ok(Some(remote))
}

fn parse_v1_line(line: &[u8]) -> io::Result<Option<Address>> {
    let line = std::str::from_utf8(line)
        .map_err(|_| io::Error::other("proxy protocol line is not ASCII"))?;
    let mut parts = line.split(' ');

    if parts.next() != Some("PROXY") {
        return Err(io::Error::other("failed to read proxy protocol"));
    }
    match parts.next() {
        Some("UNKNOWN") => return Ok(None),
        Some("TCP4") | Some("TCP6") => {}
        _ => return Err(io::Error::other("failed to read proxy protocol")),
    }

    let src_ip = parts.next().ok_or_else(malformed)?;
    let _dst_ip = parts.next().ok_or_else(malformed)?;
    let src_port = parts.next().ok_or_else(malformed)?;
    let _dst_port = parts.next().ok_or_else(malformed)?;

    let ip: IpAddr = src_ip.parse().map_err(|_| malformed())?;
    let port: u16 = src_port.parse().map_err(|_| malformed())?;
    Ok(Some(Address::new(SocketAddr::new(ip, port))))
}

fn malformed() -> io::Error {
    io::Error::other("failed to read proxy protocol")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn peek(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_PEEK,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Consume exactly `len` bytes previously seen via peek.
fn consume(fd: RawFd, len: usize) -> io::Result<()> {
    let mut buf = [0u8; MAX_HEADER_SIZE];
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, len, 0) };
    if rc != len as isize {
        return Err(io::Error::other("short read consuming proxy protocol header"));
    }
    Ok(())
}

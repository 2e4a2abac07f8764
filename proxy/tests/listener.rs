//! Listener behavior over real loopback sockets: original-destination
//! redirect, PROXY protocol, and the fatal accept path.

use bytes::BytesMut;
use event::{Dispatcher, RunType};
use proxy::Address;
use proxy::connection::{Connection, FilterChainFactory, FilterStatus, ReadFilter};
use proxy::handler::ConnectionHandler;
use proxy::listener::{ListenSocket, ListenerOptions};
use stats::{HeapStatDataAllocator, Store};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SinkFilter {
    data: Rc<RefCell<Vec<u8>>>,
}

impl ReadFilter for SinkFilter {
    fn on_data(&mut self, data: &mut BytesMut) -> FilterStatus {
        let chunk = data.split_to(data.len());
        self.data.borrow_mut().extend_from_slice(&chunk);
        FilterStatus::Continue
    }
}

/// Records accepted connections and everything they read.
#[derive(Default)]
struct RecordingFactory {
    connections: RefCell<Vec<Connection>>,
    data: Rc<RefCell<Vec<u8>>>,
}

impl FilterChainFactory for RecordingFactory {
    fn create_filter_chain(&self, connection: &Connection) -> bool {
        self.connections.borrow_mut().push(connection.clone());
        connection.add_read_filter(Box::new(SinkFilter {
            data: self.data.clone(),
        }));
        true
    }
}

fn pump(dispatcher: &Dispatcher, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() && Instant::now() < deadline {
        dispatcher.run(RunType::NonBlock);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(done(), "timed out waiting for condition");
}

fn test_store() -> Store {
    Store::new(Arc::new(HeapStatDataAllocator::new()))
}

fn bind_local() -> Arc<ListenSocket> {
    Arc::new(ListenSocket::bind(Address::resolve_url("tcp://127.0.0.1:0").unwrap()).unwrap())
}

#[test]
fn original_dst_redirects_to_exact_sibling() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store);

    let factory_a = Rc::new(RecordingFactory::default());
    let factory_b = Rc::new(RecordingFactory::default());

    let socket_a = bind_local();
    let socket_b = bind_local();
    let b_address = socket_b.local_address();

    let listener_a = handler.add_listener(
        factory_a.clone(),
        socket_a.clone(),
        ListenerOptions {
            use_original_dst: true,
            ..Default::default()
        },
    );
    handler.add_listener(
        factory_b.clone(),
        socket_b,
        ListenerOptions::default(),
    );

    // Pretend iptables redirected this connection from B's address.
    listener_a.set_original_dst_lookup(Rc::new(move |_fd| Some(b_address)));

    let _client = TcpStream::connect(socket_a.local_address().socket_addr()).unwrap();
    pump(&dispatcher, || !factory_b.connections.borrow().is_empty());

    // A's callbacks never saw the connection; B's did, under B's address.
    assert!(factory_a.connections.borrow().is_empty());
    assert_eq!(factory_b.connections.borrow().len(), 1);
    assert_eq!(
        factory_b.connections.borrow()[0].local_address(),
        b_address
    );
}

#[test]
fn original_dst_falls_back_to_wildcard_listener() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store);

    let factory_a = Rc::new(RecordingFactory::default());
    let factory_b = Rc::new(RecordingFactory::default());

    let socket_a = bind_local();
    // Wildcard sibling.
    let socket_b =
        Arc::new(ListenSocket::bind(Address::resolve_url("tcp://0.0.0.0:0").unwrap()).unwrap());
    let b_port = socket_b.local_address().port();
    let resolved = Address::resolve_url(&format!("tcp://127.0.0.1:{}", b_port)).unwrap();

    let listener_a = handler.add_listener(
        factory_a.clone(),
        socket_a.clone(),
        ListenerOptions {
            use_original_dst: true,
            ..Default::default()
        },
    );
    handler.add_listener(
        factory_b.clone(),
        socket_b,
        ListenerOptions::default(),
    );

    listener_a.set_original_dst_lookup(Rc::new(move |_fd| Some(resolved)));

    let _client = TcpStream::connect(socket_a.local_address().socket_addr()).unwrap();
    pump(&dispatcher, || !factory_b.connections.borrow().is_empty());

    assert!(factory_a.connections.borrow().is_empty());
    assert_eq!(
        factory_b.connections.borrow()[0].local_address(),
        resolved
    );
}

#[test]
fn original_dst_without_sibling_is_handled_locally() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store);

    let factory = Rc::new(RecordingFactory::default());
    let socket = bind_local();
    let other = Address::resolve_url("tcp://127.0.0.1:1").unwrap();

    let listener = handler.add_listener(
        factory.clone(),
        socket.clone(),
        ListenerOptions {
            use_original_dst: true,
            ..Default::default()
        },
    );
    listener.set_original_dst_lookup(Rc::new(move |_fd| Some(other)));

    let _client = TcpStream::connect(socket.local_address().socket_addr()).unwrap();
    pump(&dispatcher, || !factory.connections.borrow().is_empty());

    // No listener owns the resolved address: handled here, reported under
    // the original destination.
    assert_eq!(factory.connections.borrow()[0].local_address(), other);
}

#[test]
fn proxy_protocol_v1_rewrites_remote_address() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store);

    let factory = Rc::new(RecordingFactory::default());
    let socket = bind_local();
    handler.add_listener(
        factory.clone(),
        socket.clone(),
        ListenerOptions {
            use_proxy_proto: true,
            ..Default::default()
        },
    );

    let mut client = TcpStream::connect(socket.local_address().socket_addr()).unwrap();
    client
        .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 443\r\nhello")
        .unwrap();

    pump(&dispatcher, || {
        !factory.connections.borrow().is_empty() && factory.data.borrow().len() == 5
    });

    assert_eq!(
        factory.connections.borrow()[0].remote_address().to_string(),
        "203.0.113.7:56324"
    );
    // The header never reaches the filters.
    assert_eq!(&*factory.data.borrow(), b"hello");
}

#[test]
fn proxy_protocol_v2_rewrites_remote_address() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store);

    let factory = Rc::new(RecordingFactory::default());
    let socket = bind_local();
    handler.add_listener(
        factory.clone(),
        socket.clone(),
        ListenerOptions {
            use_proxy_proto: true,
            ..Default::default()
        },
    );

    // v2 PROXY, TCP4, 12 bytes of addresses: 203.0.113.7:56324 -> 10.0.0.1:443.
    let mut header: Vec<u8> = b"\r\n\r\n\x00\r\nQUIT\n".to_vec();
    header.push(0x21); // version 2, command PROXY
    header.push(0x11); // TCP over IPv4
    header.extend_from_slice(&12u16.to_be_bytes());
    header.extend_from_slice(&[203, 0, 113, 7]);
    header.extend_from_slice(&[10, 0, 0, 1]);
    header.extend_from_slice(&56324u16.to_be_bytes());
    header.extend_from_slice(&443u16.to_be_bytes());

    let mut client = TcpStream::connect(socket.local_address().socket_addr()).unwrap();
    client.write_all(&header).unwrap();
    client.write_all(b"payload").unwrap();

    pump(&dispatcher, || {
        !factory.connections.borrow().is_empty() && factory.data.borrow().len() == 7
    });

    assert_eq!(
        factory.connections.borrow()[0].remote_address().to_string(),
        "203.0.113.7:56324"
    );
    assert_eq!(&*factory.data.borrow(), b"payload");
}

#[test]
fn malformed_proxy_protocol_closes_and_counts() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store.clone());

    let factory = Rc::new(RecordingFactory::default());
    let socket = bind_local();
    handler.add_listener(
        factory.clone(),
        socket.clone(),
        ListenerOptions {
            use_proxy_proto: true,
            ..Default::default()
        },
    );

    let mut client = TcpStream::connect(socket.local_address().socket_addr()).unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n").unwrap();

    let error_counter = store.counter("downstream_cx_proxy_proto_error");
    pump(&dispatcher, || error_counter.value() == 1);

    // The fd was closed without ever reaching the filter chain.
    assert!(factory.connections.borrow().is_empty());
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
#[should_panic(expected = "listener accept failure")]
fn unrecoverable_accept_error_aborts() {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = test_store();
    let handler = ConnectionHandler::new(dispatcher.clone(), store);

    // A datagram socket cannot accept; readiness drives accept4 into a
    // non-transient error.
    let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let udp_addr = udp.local_addr().unwrap();
    let udp_fd = unsafe { OwnedFd::from_raw_fd(udp.into_raw_fd()) };
    let socket = Arc::new(ListenSocket::from_fd(udp_fd).unwrap());

    let factory = Rc::new(RecordingFactory::default());
    handler.add_listener(factory, socket, ListenerOptions::default());

    let poker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    poker.send_to(b"x", udp_addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        dispatcher.run(RunType::NonBlock);
        std::thread::sleep(Duration::from_millis(1));
    }
}

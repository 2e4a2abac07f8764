//! End-to-end: downstream client through the TCP proxy filter to a real
//! upstream, and back.

use event::{Dispatcher, RunType};
use proxy::Address;
use proxy::handler::ConnectionHandler;
use proxy::listener::{ListenSocket, ListenerOptions};
use proxy::tcp_proxy::TcpProxyFilterFactory;
use proxy::upstream::{ClusterInfo, ResourceManager};
use stats::{HeapStatDataAllocator, Store};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blocking echo server used as the upstream.
fn spawn_echo_upstream() -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        // One connection is all the test needs.
        if let Ok((mut socket, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = socket.read(&mut buf) {
                if n == 0 {
                    break;
                }
                if socket.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });
    (address, handle)
}

#[test]
fn proxies_bytes_both_ways() {
    let (upstream_address, upstream_thread) = spawn_echo_upstream();

    let dispatcher = Rc::new(Dispatcher::new());
    let store = Store::new(Arc::new(HeapStatDataAllocator::new()));
    let handler = ConnectionHandler::new(dispatcher.clone(), store.clone());

    let cluster = Arc::new(ClusterInfo::new(
        "echo",
        Address::new(upstream_address),
        Duration::from_secs(5),
        1024 * 1024,
        0,
        ResourceManager::new(16, 16, 16, 3),
        &store,
    ));

    let socket =
        Arc::new(ListenSocket::bind(Address::resolve_url("tcp://127.0.0.1:0").unwrap()).unwrap());
    let listen_address = socket.local_address();
    let factory = Rc::new(TcpProxyFilterFactory::new(dispatcher.clone(), cluster.clone()));
    handler.add_listener(factory, socket, ListenerOptions::default());

    let mut client = TcpStream::connect(listen_address.socket_addr()).unwrap();
    client.set_nodelay(true).unwrap();
    client.set_nonblocking(true).unwrap();
    client.write_all(b"ping through the proxy").unwrap();

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < 22 && Instant::now() < deadline {
        dispatcher.run(RunType::NonBlock);
        let mut buf = [0u8; 4096];
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read error: {}", e),
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(received, b"ping through the proxy");
    assert_eq!(cluster.stats.upstream_cx_total.value(), 1);

    // Downstream close tears the upstream side down and the echo thread
    // finishes.
    drop(client);
    let deadline = Instant::now() + Duration::from_secs(5);
    while handler.num_connections() > 0 && Instant::now() < deadline {
        dispatcher.run(RunType::NonBlock);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handler.num_connections(), 0);
    upstream_thread.join().unwrap();
}

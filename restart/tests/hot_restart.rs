//! Hot-restart integration: shared stat slots and the fd-passing RPC.

use restart::{HotRestart, HotRestartServer, ParentStats};
use stats::StatDataAllocator;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Region and socket names are namespaced by base id, so every test gets a
/// private namespace derived from the test process.
fn private_base_id(offset: u32) -> u32 {
    std::process::id().wrapping_mul(31).wrapping_add(offset)
}

#[test]
fn stats_are_shared_between_generations() {
    let base_id = private_base_id(1);
    let parent = HotRestart::new(base_id, 0).expect("parent start");
    let child = HotRestart::new(base_id, 1).expect("child start");

    let parent_alloc = parent.stat_allocator();
    let child_alloc = child.stat_allocator();

    let a = parent_alloc.alloc("x").unwrap();
    let b = child_alloc.alloc("x").unwrap();

    // Same slot through both mappings.
    assert_eq!(a.get().ref_count, 2);
    a.get().counter_value.fetch_add(5, Ordering::Relaxed);
    assert_eq!(b.get().counter_value.load(Ordering::Relaxed), 5);

    child_alloc.free(b);
    assert_eq!(a.get().ref_count, 1);

    parent_alloc.free(a);
    // Slot went back to the free pool; a fresh alloc starts clean.
    let c = parent_alloc.alloc("x").unwrap();
    assert_eq!(c.get().ref_count, 1);
    assert_eq!(c.get().counter_value.load(Ordering::Relaxed), 0);
    parent_alloc.free(c);

    parent.shared_memory().unlink();
}

#[test]
fn attach_refuses_mismatched_region() {
    let base_id = private_base_id(2);

    // Fabricate a large zeroed region: size and version read as zero, which
    // can never match.
    let name = std::ffi::CString::new(format!("/bloomery_shared_memory_{}", base_id)).unwrap();
    unsafe {
        libc::shm_unlink(name.as_ptr());
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600);
        assert!(fd != -1);
        assert_eq!(libc::ftruncate(fd, 16 << 20), 0);
        libc::close(fd);
    }

    let result = HotRestart::new(base_id, 1);
    assert!(matches!(
        result,
        Err(restart::Error::VersionMismatch { .. })
    ));

    unsafe {
        libc::shm_unlink(name.as_ptr());
    }
}

struct TestServer {
    listener: TcpListener,
    address: String,
    drained: Arc<AtomicBool>,
}

impl HotRestartServer for TestServer {
    fn listen_socket_fd(&self, address: &str) -> Option<i32> {
        (address == self.address).then(|| self.listener.as_raw_fd())
    }

    fn drain_listeners(&self) {
        self.drained.store(true, Ordering::SeqCst);
    }

    fn shutdown_admin(&self) {}

    fn original_start_time(&self) -> u64 {
        1234
    }

    fn stats_snapshot(&self) -> ParentStats {
        ParentStats {
            memory_allocated: 77,
            num_connections: 3,
        }
    }
}

#[test]
fn rpc_round_trip_passes_listen_socket() {
    let base_id = private_base_id(3);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let listen_address = listener.local_addr().unwrap().to_string();

    // Capture the socket identity before the listener moves to the parent.
    let original_ino = fstat_ino(listener.as_raw_fd());

    let drained = Arc::new(AtomicBool::new(false));
    let drained_parent = drained.clone();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let parent_address = listen_address.clone();

    let parent_thread = std::thread::spawn(move || {
        let parent = Rc::new(HotRestart::new(base_id, 0).expect("parent start"));
        let dispatcher = event::Dispatcher::new();
        parent.clone().initialize(
            &dispatcher,
            Rc::new(TestServer {
                listener,
                address: parent_address,
                drained: drained_parent,
            }),
        );
        ready_tx.send(()).unwrap();

        // Stand-in for the parent's event loop.
        while stop_rx.try_recv().is_err() {
            parent.process_pending_rpcs();
            std::thread::sleep(Duration::from_millis(2));
        }
        parent.shared_memory().unlink();
    });

    ready_rx.recv().unwrap();
    let child = HotRestart::new(base_id, 1).expect("child start");

    // A listener the parent does not have.
    assert!(
        child
            .duplicate_parent_listen_socket("tcp://127.0.0.1:1")
            .is_none()
    );

    // The real one arrives as an open fd referring to the same socket.
    let fd = child
        .duplicate_parent_listen_socket(&listen_address)
        .expect("listen socket fd");
    assert_eq!(fstat_ino(fd.as_raw_fd()), original_ino);

    let stats = child.get_parent_stats();
    assert_eq!(stats.memory_allocated, 77);
    assert_eq!(stats.num_connections, 3);

    assert_eq!(child.shutdown_parent_admin(), Some(1234));

    child.drain_parent_listeners();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !drained.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(drained.load(Ordering::SeqCst));

    stop_tx.send(()).unwrap();
    parent_thread.join().unwrap();
}

fn fstat_ino(fd: i32) -> (u64, u64) {
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        assert_eq!(libc::fstat(fd, &mut st), 0);
        (st.st_dev, st.st_ino)
    }
}

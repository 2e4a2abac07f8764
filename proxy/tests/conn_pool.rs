//! Connection pool behavior, driven through a mock codec client.

use event::{Dispatcher, RunType};
use proxy::Address;
use proxy::upstream::{
    ClusterInfo, CodecClient, CodecClientEvent, CodecClientEventSink, CodecClientFactory, ConnPool,
    PoolCallbacks, PoolFailureReason, ResourceManager, ResponseDecoder, StreamHandle,
    StreamResetReason,
};
use stats::{HeapStatDataAllocator, Store};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

// ── Mock codec ──────────────────────────────────────────────────────────

struct MockClientState {
    sink: CodecClientEventSink,
    closed: Cell<bool>,
    new_streams: Cell<usize>,
}

#[derive(Default)]
struct MockFactoryShared {
    clients: RefCell<Vec<Rc<MockClientState>>>,
    destroyed: Cell<usize>,
}

struct MockFactory {
    shared: Rc<MockFactoryShared>,
}

impl CodecClientFactory for MockFactory {
    fn create(
        &mut self,
        _dispatcher: &Rc<Dispatcher>,
        _cluster: &Arc<ClusterInfo>,
        sink: CodecClientEventSink,
    ) -> Box<dyn CodecClient> {
        let state = Rc::new(MockClientState {
            sink,
            closed: Cell::new(false),
            new_streams: Cell::new(0),
        });
        self.shared.clients.borrow_mut().push(state.clone());
        Box::new(MockCodecClient {
            state,
            shared: self.shared.clone(),
        })
    }
}

struct MockCodecClient {
    state: Rc<MockClientState>,
    shared: Rc<MockFactoryShared>,
}

impl CodecClient for MockCodecClient {
    fn connect(&mut self) {}

    fn new_stream(&mut self, _decoder: Box<dyn ResponseDecoder>) -> StreamHandle {
        self.state.new_streams.set(self.state.new_streams.get() + 1);
        StreamHandle::new()
    }

    fn close(&mut self) {
        // A real close reports synchronously through the connection event
        // path.
        if !self.state.closed.replace(true) {
            (self.state.sink)(CodecClientEvent::LocalClose);
        }
    }

    fn has_active_request(&self) -> bool {
        false
    }
}

impl Drop for MockCodecClient {
    fn drop(&mut self) {
        self.shared.destroyed.set(self.shared.destroyed.get() + 1);
    }
}

// ── Callbacks and decoders ──────────────────────────────────────────────

struct NullDecoder;

impl ResponseDecoder for NullDecoder {
    fn decode_headers(&mut self, _status: u16, _headers: Vec<(String, String)>, _end: bool) {}
    fn decode_data(&mut self, _data: &[u8], _end: bool) {}
}

fn decoder() -> Box<dyn ResponseDecoder> {
    Box::new(NullDecoder)
}

#[derive(Default)]
struct RecordingCallbacks {
    ready: Cell<usize>,
    streams: RefCell<Vec<StreamHandle>>,
    failures: RefCell<Vec<PoolFailureReason>>,
    on_failure_hook: RefCell<Option<Box<dyn FnMut()>>>,
}

impl PoolCallbacks for RecordingCallbacks {
    fn on_pool_ready(&mut self, stream: StreamHandle) {
        self.ready.set(self.ready.get() + 1);
        self.streams.borrow_mut().push(stream);
    }

    fn on_pool_failure(&mut self, reason: PoolFailureReason) {
        self.failures.borrow_mut().push(reason);
        if let Some(hook) = self.on_failure_hook.borrow_mut().as_mut() {
            hook();
        }
    }
}

fn callbacks() -> Rc<RefCell<RecordingCallbacks>> {
    Rc::new(RefCell::new(RecordingCallbacks::default()))
}

// ── Fixture ─────────────────────────────────────────────────────────────

struct Fixture {
    dispatcher: Rc<Dispatcher>,
    cluster: Arc<ClusterInfo>,
    pool: ConnPool,
    mock: Rc<MockFactoryShared>,
}

fn fixture(
    max_connections: u64,
    max_pending: u64,
    connect_timeout: Duration,
    max_requests_per_connection: u64,
) -> Fixture {
    let dispatcher = Rc::new(Dispatcher::new());
    let store = Store::new(Arc::new(HeapStatDataAllocator::new()));
    let cluster = Arc::new(ClusterInfo::new(
        "backend",
        Address::resolve_url("tcp://127.0.0.1:9000").unwrap(),
        connect_timeout,
        1024 * 1024,
        max_requests_per_connection,
        ResourceManager::new(max_connections, max_pending, 1024, 3),
        &store,
    ));
    let mock = Rc::new(MockFactoryShared::default());
    let pool = ConnPool::new(
        dispatcher.clone(),
        cluster.clone(),
        Box::new(MockFactory {
            shared: mock.clone(),
        }),
    );
    Fixture {
        dispatcher,
        cluster,
        pool,
        mock,
    }
}

impl Fixture {
    fn raise(&self, client: usize, event: CodecClientEvent) {
        let sink = self.mock.clients.borrow()[client].sink.clone();
        sink(event);
    }

    fn clients_created(&self) -> usize {
        self.mock.clients.borrow().len()
    }

    fn destroyed(&self) -> usize {
        self.mock.destroyed.get()
    }

    fn assert_gauges_zero(&self) {
        assert_eq!(self.cluster.stats.upstream_cx_active.value(), 0);
        assert_eq!(self.cluster.resources.connections.count(), 0);
        assert_eq!(self.cluster.resources.pending_requests.count(), 0);
    }
}

const NO_TIMEOUT: Duration = Duration::from_secs(3600);

// ── Scenarios ───────────────────────────────────────────────────────────

#[test]
fn multiple_request_and_response() {
    let f = fixture(1024, 1024, NO_TIMEOUT, 0);

    // Request 1 kicks off a new connection.
    let cb1 = callbacks();
    let handle = f.pool.new_stream(decoder(), cb1.clone());
    assert!(handle.is_some());
    assert_eq!(f.clients_created(), 1);
    assert_eq!(f.pool.num_pending_requests(), 1);

    f.raise(0, CodecClientEvent::Connected);
    assert_eq!(cb1.borrow().ready.get(), 1);
    assert_eq!(f.pool.num_busy_clients(), 1);

    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    assert_eq!(f.pool.num_ready_clients(), 1);

    // Request 2 binds immediately; no new client.
    let cb2 = callbacks();
    let handle = f.pool.new_stream(decoder(), cb2.clone());
    assert!(handle.is_none());
    assert_eq!(cb2.borrow().ready.get(), 1);
    assert_eq!(f.clients_created(), 1);

    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });

    // The upstream goes away; the client is destroyed exactly once.
    f.raise(0, CodecClientEvent::RemoteClose);
    assert_eq!(f.destroyed(), 0);
    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 1);

    assert_eq!(f.cluster.stats.upstream_cx_total.value(), 1);
    assert_eq!(f.cluster.stats.upstream_cx_destroy.value(), 1);
    f.assert_gauges_zero();
}

#[test]
fn max_pending_requests_overflow() {
    let f = fixture(1, 1, NO_TIMEOUT, 0);

    let cb1 = callbacks();
    let handle1 = f.pool.new_stream(decoder(), cb1.clone());
    assert!(handle1.is_some());

    // Second request: connection and pending slots are both exhausted.
    let cb2 = callbacks();
    let handle2 = f.pool.new_stream(decoder(), cb2.clone());
    assert!(handle2.is_none());
    assert_eq!(
        *cb2.borrow().failures.borrow(),
        vec![PoolFailureReason::Overflow]
    );
    assert_eq!(f.cluster.stats.upstream_rq_pending_overflow.value(), 1);

    handle1.unwrap().cancel();
    f.raise(0, CodecClientEvent::RemoteClose);
    f.dispatcher.clear_deferred_delete_list();

    assert_eq!(f.destroyed(), 1);
    assert_eq!(f.pool.num_pending_requests(), 0);
    assert_eq!(f.pool.num_clients(), 0);
    assert!(cb1.borrow().failures.borrow().is_empty());
    f.assert_gauges_zero();
}

#[test]
fn connect_failure_ejects_pending() {
    let f = fixture(1024, 1024, NO_TIMEOUT, 0);

    let cb = callbacks();
    let handle = f.pool.new_stream(decoder(), cb.clone());
    assert!(handle.is_some());

    f.raise(0, CodecClientEvent::RemoteClose);
    assert_eq!(
        *cb.borrow().failures.borrow(),
        vec![PoolFailureReason::ConnectionFailure]
    );
    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 1);

    assert_eq!(f.cluster.stats.upstream_cx_connect_fail.value(), 1);
    assert_eq!(f.cluster.stats.upstream_rq_pending_failure_eject.value(), 1);
    f.assert_gauges_zero();
}

#[test]
fn connect_timeout_allows_replacement_from_callback() {
    let f = fixture(1024, 1024, Duration::ZERO, 0);

    // The failure callback for request 1 immediately issues request 2.
    let cb2 = callbacks();
    let cb1 = callbacks();
    {
        let pool = f.pool.clone();
        let cb2 = cb2.clone();
        *cb1.borrow().on_failure_hook.borrow_mut() = Some(Box::new(move || {
            assert!(pool.new_stream(decoder(), cb2.clone()).is_some());
        }));
    }

    assert!(f.pool.new_stream(decoder(), cb1.clone()).is_some());
    assert_eq!(f.clients_created(), 1);

    // Fire client 1's connect timer; the callback spawns client 2.
    f.dispatcher.run(RunType::NonBlock);
    assert_eq!(
        *cb1.borrow().failures.borrow(),
        vec![PoolFailureReason::ConnectionFailure]
    );
    assert_eq!(f.clients_created(), 2);

    // Fire client 2's connect timer.
    f.dispatcher.run(RunType::NonBlock);
    assert_eq!(
        *cb2.borrow().failures.borrow(),
        vec![PoolFailureReason::ConnectionFailure]
    );

    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 2);
    assert_eq!(f.cluster.stats.upstream_cx_connect_timeout.value(), 2);
    assert_eq!(f.cluster.stats.upstream_cx_connect_fail.value(), 2);
    f.assert_gauges_zero();
}

#[test]
fn cancel_before_bound() {
    let f = fixture(1024, 1024, NO_TIMEOUT, 0);

    let cb = callbacks();
    let handle = f.pool.new_stream(decoder(), cb.clone()).unwrap();
    handle.cancel();
    // Idempotent.
    handle.cancel();

    f.raise(0, CodecClientEvent::Connected);
    assert_eq!(f.pool.num_ready_clients(), 1);

    f.raise(0, CodecClientEvent::RemoteClose);
    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 1);

    assert_eq!(cb.borrow().ready.get(), 0);
    assert!(cb.borrow().failures.borrow().is_empty());
    f.assert_gauges_zero();
}

#[test]
fn disconnect_while_bound_resets_stream() {
    let f = fixture(1024, 1024, NO_TIMEOUT, 0);

    let cb = callbacks();
    f.pool.new_stream(decoder(), cb.clone());
    f.raise(0, CodecClientEvent::Connected);
    assert_eq!(cb.borrow().ready.get(), 1);

    let resets: Rc<RefCell<Vec<StreamResetReason>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let resets = resets.clone();
        cb.borrow().streams.borrow()[0]
            .add_reset_callback(move |reason| resets.borrow_mut().push(reason));
    }

    // Kill the connection while the request is in flight.
    f.raise(0, CodecClientEvent::RemoteClose);
    assert_eq!(*resets.borrow(), vec![StreamResetReason::ConnectionTermination]);
    assert_eq!(f.cluster.stats.upstream_cx_destroy_with_active_rq.value(), 1);

    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 1);
    f.assert_gauges_zero();
}

#[test]
fn max_connections_queues_and_binds_in_order() {
    let f = fixture(1, 1024, NO_TIMEOUT, 0);

    let cb1 = callbacks();
    assert!(f.pool.new_stream(decoder(), cb1.clone()).is_some());

    // Request 2 must not create a second connection.
    let cb2 = callbacks();
    assert!(f.pool.new_stream(decoder(), cb2.clone()).is_some());
    assert_eq!(f.cluster.stats.upstream_cx_overflow.value(), 1);
    assert_eq!(f.clients_created(), 1);

    // Connect binds request 1.
    f.raise(0, CodecClientEvent::Connected);
    assert_eq!(cb1.borrow().ready.get(), 1);
    assert_eq!(cb2.borrow().ready.get(), 0);

    // Finishing request 1 immediately binds request 2.
    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    assert_eq!(cb2.borrow().ready.get(), 1);

    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    f.raise(0, CodecClientEvent::RemoteClose);
    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 1);
    f.assert_gauges_zero();
}

#[test]
fn connection_close_header_drains_client() {
    let f = fixture(1024, 1024, NO_TIMEOUT, 0);

    let cb = callbacks();
    f.pool.new_stream(decoder(), cb.clone());
    f.raise(0, CodecClientEvent::Connected);

    // Response carries `Connection: close`; the client drains and closes.
    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: true });
    f.dispatcher.clear_deferred_delete_list();

    assert_eq!(f.destroyed(), 1);
    assert_eq!(f.cluster.stats.upstream_cx_destroy_with_active_rq.value(), 0);
    f.assert_gauges_zero();
}

#[test]
fn max_requests_per_connection_drains_client() {
    let f = fixture(1024, 1024, NO_TIMEOUT, 1);

    let cb = callbacks();
    f.pool.new_stream(decoder(), cb.clone());
    f.raise(0, CodecClientEvent::Connected);
    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    f.dispatcher.clear_deferred_delete_list();

    assert_eq!(f.destroyed(), 1);
    assert_eq!(f.cluster.stats.upstream_cx_max_requests.value(), 1);
    assert_eq!(f.cluster.stats.upstream_cx_destroy_with_active_rq.value(), 0);
    f.assert_gauges_zero();
}

#[test]
fn concurrent_connections_fifo_pending() {
    let f = fixture(2, 1024, NO_TIMEOUT, 0);

    let cb1 = callbacks();
    let cb2 = callbacks();
    let cb3 = callbacks();
    assert!(f.pool.new_stream(decoder(), cb1.clone()).is_some());
    assert!(f.pool.new_stream(decoder(), cb2.clone()).is_some());
    assert_eq!(f.clients_created(), 2);

    // Third request queues behind the connection limit.
    assert!(f.pool.new_stream(decoder(), cb3.clone()).is_some());
    assert_eq!(f.clients_created(), 2);

    f.raise(0, CodecClientEvent::Connected);
    f.raise(1, CodecClientEvent::Connected);
    assert_eq!(cb1.borrow().ready.get(), 1);
    assert_eq!(cb2.borrow().ready.get(), 1);
    assert_eq!(cb3.borrow().ready.get(), 0);

    // Finishing request 1 gets request 3 going.
    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    assert_eq!(cb3.borrow().ready.get(), 1);

    f.raise(1, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });

    f.raise(1, CodecClientEvent::RemoteClose);
    f.raise(0, CodecClientEvent::RemoteClose);
    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 2);
    f.assert_gauges_zero();
}

#[test]
fn drained_callbacks_fire_on_empty_transitions() {
    let f = fixture(1, 1024, NO_TIMEOUT, 0);
    let drained = Rc::new(Cell::new(0));

    // Empty pool: fires immediately.
    {
        let drained = drained.clone();
        f.pool.add_drained_callback(move || drained.set(drained.get() + 1));
    }
    assert_eq!(drained.get(), 1);

    let cb1 = callbacks();
    f.pool.new_stream(decoder(), cb1.clone());
    f.raise(0, CodecClientEvent::Connected);
    assert_eq!(cb1.borrow().ready.get(), 1);

    let cb2 = callbacks();
    let handle2 = f.pool.new_stream(decoder(), cb2.clone()).unwrap();
    handle2.cancel();
    // Still busy with request 1: no new firing.
    assert_eq!(drained.get(), 1);

    // Request 1 completes; the idle client is torn down and the stack of
    // callbacks fires again.
    f.raise(0, CodecClientEvent::ResponseComplete { saw_connection_close: false });
    assert_eq!(drained.get(), 2);

    f.dispatcher.clear_deferred_delete_list();
    assert_eq!(f.destroyed(), 1);
    f.assert_gauges_zero();
}

/// Randomized new_stream/cancel interleavings: the resource invariants hold
/// throughout, and every request resolves exactly once.
#[test]
fn admission_invariants_under_random_churn() {
    const MAX_CONNECTIONS: u64 = 2;
    const MAX_PENDING: u64 = 2;

    let f = fixture(MAX_CONNECTIONS, MAX_PENDING, NO_TIMEOUT, 0);

    struct Request {
        callbacks: Rc<RefCell<RecordingCallbacks>>,
        handle: Option<proxy::upstream::PendingRequestHandle>,
        cancelled: bool,
    }
    let mut requests: Vec<Request> = Vec::new();

    // Deterministic LCG so failures reproduce.
    let mut state: u64 = 0x2545F4914F6CDD1D;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as usize
    };

    for _ in 0..200 {
        match next() % 4 {
            // New request.
            0 | 1 => {
                let cb = callbacks();
                let handle = f.pool.new_stream(decoder(), cb.clone());
                requests.push(Request {
                    callbacks: cb,
                    handle,
                    cancelled: false,
                });
            }
            // Cancel a random outstanding handle.
            2 => {
                let candidates: Vec<usize> = requests
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.handle.is_some() && !r.cancelled)
                    .map(|(i, _)| i)
                    .collect();
                if !candidates.is_empty() {
                    let i = candidates[next() % candidates.len()];
                    requests[i].handle.as_ref().unwrap().cancel();
                    requests[i].cancelled = true;
                }
            }
            // Let a random client make progress.
            _ => {
                let clients = f.mock.clients.borrow().len();
                if clients > 0 {
                    let i = next() % clients;
                    let closed = f.mock.clients.borrow()[i].closed.get();
                    if !closed {
                        match next() % 3 {
                            0 => f.raise(i, CodecClientEvent::Connected),
                            1 => f.raise(
                                i,
                                CodecClientEvent::ResponseComplete {
                                    saw_connection_close: false,
                                },
                            ),
                            _ => f.raise(i, CodecClientEvent::RemoteClose),
                        }
                    }
                }
            }
        }

        assert!(f.pool.num_clients() as u64 <= MAX_CONNECTIONS);
        assert!(f.pool.num_pending_requests() as u64 <= MAX_PENDING);
        assert!(f.cluster.resources.connections.count() <= MAX_CONNECTIONS);
        assert!(f.cluster.resources.pending_requests.count() <= MAX_PENDING);
    }

    // Tear down: fail every remaining client, then cancel what's left.
    loop {
        let open: Vec<usize> = {
            let clients = f.mock.clients.borrow();
            clients
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.closed.get())
                .map(|(i, _)| i)
                .collect()
        };
        if open.is_empty() || f.pool.num_clients() == 0 {
            break;
        }
        for i in open {
            f.raise(i, CodecClientEvent::RemoteClose);
        }
    }
    for request in &mut requests {
        if let Some(handle) = &request.handle {
            handle.cancel();
            request.cancelled = true;
        }
    }
    f.dispatcher.clear_deferred_delete_list();

    assert_eq!(f.pool.num_pending_requests(), 0);
    assert_eq!(f.pool.num_clients(), 0);
    f.assert_gauges_zero();

    // Each request resolved at most once through callbacks, and everything
    // not resolved was cancellable.
    for request in &requests {
        let cb = request.callbacks.borrow();
        let outcomes = cb.ready.get() + cb.failures.borrow().len();
        assert!(outcomes <= 1);
        if outcomes == 0 {
            assert!(request.handle.is_none() || request.cancelled);
        }
    }
}

//! HTTP/1 upstream connection pool.
//!
//! Binds logical stream requests to a bounded set of upstream connections.
//! Each accepted request ends in exactly one of: bound to a stream
//! (`on_pool_ready`), rejected (`on_pool_failure` with the reason), or
//! cancelled. Pending requests are strictly FIFO, and a newly ready client
//! always serves the oldest pending request first.
//!
//! Codec events may arrive while the pool is mid-dispatch (a close issued
//! from inside event handling reports synchronously), so events enter
//! through a queue drained by the outermost call. User callbacks always run
//! with the pool unlocked and may re-enter `new_stream`.

use crate::upstream::cluster::ClusterInfo;
use crate::upstream::codec::{
    CodecClient, CodecClientEvent, CodecClientFactory, ResponseDecoder, StreamHandle,
    StreamResetReason,
};
use event::{Dispatcher, Timer};
use slab::Slab;
use stats::Timespan;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// Admission rejected: the pending queue is full.
    Overflow,
    /// The upstream connection failed or timed out before binding.
    ConnectionFailure,
}

/// Receives the outcome of a `new_stream` call.
pub trait PoolCallbacks {
    fn on_pool_ready(&mut self, stream: StreamHandle);
    fn on_pool_failure(&mut self, reason: PoolFailureReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Ready,
    Busy,
    /// Serving its last response; closes on completion.
    Draining,
}

struct ActiveClient {
    codec: Box<dyn CodecClient>,
    state: ClientState,
    generation: u64,
    /// Armed exactly while connecting; doubles as the connecting marker.
    connect_timer: Option<Timer>,
    connect_span: Option<Timespan>,
    _length_span: Timespan,
    bound_stream: Option<StreamHandle>,
    requests_served: u64,
    cluster: Arc<ClusterInfo>,
}

impl Drop for ActiveClient {
    fn drop(&mut self) {
        self.cluster.stats.upstream_cx_destroy.inc();
        self.cluster.stats.upstream_cx_active.dec();
        self.cluster.resources.connections.dec();
    }
}

struct PendingRequest {
    id: u64,
    decoder: Option<Box<dyn ResponseDecoder>>,
    callbacks: Rc<RefCell<dyn PoolCallbacks>>,
}

enum PoolEvent {
    Codec(CodecClientEvent),
    ConnectTimeout,
}

/// Deferred side effects, run strictly after the pool state is released.
enum Action {
    Ready {
        callbacks: Rc<RefCell<dyn PoolCallbacks>>,
        stream: StreamHandle,
    },
    Failure {
        callbacks: Rc<RefCell<dyn PoolCallbacks>>,
        reason: PoolFailureReason,
    },
    ResetStream {
        stream: StreamHandle,
        reason: StreamResetReason,
    },
    Drained,
}

struct PoolInner {
    dispatcher: Rc<Dispatcher>,
    cluster: Arc<ClusterInfo>,
    factory: Box<dyn CodecClientFactory>,
    clients: Slab<ActiveClient>,
    ready_clients: Vec<usize>,
    busy_clients: Vec<usize>,
    pending_requests: VecDeque<PendingRequest>,
    next_pending_id: u64,
    next_client_generation: u64,
    drained_callbacks: Vec<Box<dyn FnMut()>>,
}

struct PoolShared {
    inner: RefCell<PoolInner>,
    // (client key, generation) tagged so stale events for a reused slab key
    // are ignored.
    events: RefCell<VecDeque<(usize, u64, PoolEvent)>>,
    dispatching: Cell<bool>,
}

/// The per-worker pool for one upstream cluster.
#[derive(Clone)]
pub struct ConnPool {
    shared: Rc<PoolShared>,
}

/// Cancel handle for a queued request. Cancellation is synchronous and
/// idempotent; after it returns no callback for the request fires.
pub struct PendingRequestHandle {
    shared: Weak<PoolShared>,
    id: u64,
}

impl PendingRequestHandle {
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let id = self.id;
        with_pool(&shared, |inner, actions| {
            if let Some(pos) = inner.pending_requests.iter().position(|p| p.id == id) {
                inner.pending_requests.remove(pos);
                inner.cluster.resources.pending_requests.dec();
                trace!(cluster = %inner.cluster.name, "pending request cancelled");
                check_for_drained(inner, actions);
            }
        });
    }
}

impl ConnPool {
    pub fn new(
        dispatcher: Rc<Dispatcher>,
        cluster: Arc<ClusterInfo>,
        factory: Box<dyn CodecClientFactory>,
    ) -> ConnPool {
        ConnPool {
            shared: Rc::new(PoolShared {
                inner: RefCell::new(PoolInner {
                    dispatcher,
                    cluster,
                    factory,
                    clients: Slab::new(),
                    ready_clients: Vec::new(),
                    busy_clients: Vec::new(),
                    pending_requests: VecDeque::new(),
                    next_pending_id: 1,
                    next_client_generation: 1,
                    drained_callbacks: Vec::new(),
                }),
                events: RefCell::new(VecDeque::new()),
                dispatching: Cell::new(false),
            }),
        }
    }

    /// Request an upstream stream.
    ///
    /// With an idle client available, `on_pool_ready` fires synchronously
    /// and there is nothing to cancel. Otherwise the request queues (and a
    /// connection is spun up if the cluster limit allows), or is rejected
    /// synchronously with `Overflow` when the pending queue is full.
    pub fn new_stream(
        &self,
        decoder: Box<dyn ResponseDecoder>,
        callbacks: Rc<RefCell<dyn PoolCallbacks>>,
    ) -> Option<PendingRequestHandle> {
        let shared = self.shared.clone();
        with_pool(&self.shared, move |inner, actions| {
            if let Some(client_id) = inner.ready_clients.pop() {
                inner.busy_clients.push(client_id);
                let client = &mut inner.clients[client_id];
                client.state = ClientState::Busy;
                let stream = client.codec.new_stream(decoder);
                client.bound_stream = Some(stream.clone());
                actions.push(Action::Ready { callbacks, stream });
                return None;
            }

            if inner.cluster.resources.connections.can_create() {
                create_new_connection(inner, &shared);
            } else {
                inner.cluster.stats.upstream_cx_overflow.inc();
            }

            if inner.cluster.resources.pending_requests.can_create() {
                debug!(
                    cluster = %inner.cluster.name,
                    "queueing request due to no available connections"
                );
                inner.cluster.resources.pending_requests.inc();
                let id = inner.next_pending_id;
                inner.next_pending_id += 1;
                inner.pending_requests.push_back(PendingRequest {
                    id,
                    decoder: Some(decoder),
                    callbacks,
                });
                Some(PendingRequestHandle {
                    shared: Rc::downgrade(&shared),
                    id,
                })
            } else {
                debug!(cluster = %inner.cluster.name, "max pending requests overflow");
                inner.cluster.stats.upstream_rq_pending_overflow.inc();
                actions.push(Action::Failure {
                    callbacks,
                    reason: PoolFailureReason::Overflow,
                });
                None
            }
        })
    }

    /// Register a callback for when the pool next becomes completely empty
    /// (no ready, busy, or pending entries). Fires immediately if already
    /// empty; idle clients are closed once nothing is in flight.
    pub fn add_drained_callback(&self, cb: impl FnMut() + 'static) {
        with_pool(&self.shared, |inner, actions| {
            inner.drained_callbacks.push(Box::new(cb));
            check_for_drained(inner, actions);
        });
    }

    pub fn num_ready_clients(&self) -> usize {
        self.shared.inner.borrow().ready_clients.len()
    }

    pub fn num_busy_clients(&self) -> usize {
        self.shared.inner.borrow().busy_clients.len()
    }

    pub fn num_pending_requests(&self) -> usize {
        self.shared.inner.borrow().pending_requests.len()
    }

    pub fn num_clients(&self) -> usize {
        self.shared.inner.borrow().clients.len()
    }
}

fn create_new_connection(inner: &mut PoolInner, shared: &Rc<PoolShared>) {
    inner.cluster.stats.upstream_cx_total.inc();
    inner.cluster.stats.upstream_cx_active.inc();
    inner.cluster.resources.connections.inc();

    let generation = inner.next_client_generation;
    inner.next_client_generation += 1;

    let key = inner.clients.vacant_key();
    debug!(cluster = %inner.cluster.name, client = key, "creating a new connection");

    let weak = Rc::downgrade(shared);
    let sink: Rc<dyn Fn(CodecClientEvent)> = Rc::new(move |event| {
        if let Some(shared) = weak.upgrade() {
            shared
                .events
                .borrow_mut()
                .push_back((key, generation, PoolEvent::Codec(event)));
            pump_events(&shared);
        }
    });

    let PoolInner {
        factory,
        dispatcher,
        cluster,
        ..
    } = &mut *inner;
    let mut codec = factory.create(dispatcher, cluster, sink);
    codec.connect();

    let weak = Rc::downgrade(shared);
    let connect_timer = inner.dispatcher.create_timer(move || {
        if let Some(shared) = weak.upgrade() {
            shared
                .events
                .borrow_mut()
                .push_back((key, generation, PoolEvent::ConnectTimeout));
            pump_events(&shared);
        }
    });
    connect_timer.enable(inner.cluster.connect_timeout);

    let client = ActiveClient {
        codec,
        state: ClientState::Connecting,
        generation,
        connect_timer: Some(connect_timer),
        connect_span: Some(inner.cluster.stats.upstream_cx_connect_ms.allocate_span()),
        _length_span: inner.cluster.stats.upstream_cx_length_ms.allocate_span(),
        bound_stream: None,
        requests_served: 0,
        cluster: inner.cluster.clone(),
    };
    let inserted = inner.clients.insert(client);
    debug_assert_eq!(inserted, key);
}

/// Run `f` against the locked pool state, then execute the side effects it
/// queued with the state released. The dispatch flag makes codec calls from
/// inside `f` safe: events they raise only enqueue, and the outermost entry
/// drains the queue once the lock is gone.
fn with_pool<R>(
    shared: &Rc<PoolShared>,
    f: impl FnOnce(&mut PoolInner, &mut Vec<Action>) -> R,
) -> R {
    let was_dispatching = shared.dispatching.replace(true);
    let mut actions = Vec::new();
    let result = {
        let mut inner = shared.inner.borrow_mut();
        f(&mut inner, &mut actions)
    };
    run_actions(shared, actions);
    if !was_dispatching {
        shared.dispatching.set(false);
        pump_events(shared);
    }
    result
}

/// Drain the event queue. Only the outermost caller dispatches; events
/// raised mid-dispatch are picked up by the active loop.
fn pump_events(shared: &Rc<PoolShared>) {
    if shared.dispatching.get() {
        return;
    }
    shared.dispatching.set(true);

    loop {
        let Some((key, generation, event)) = shared.events.borrow_mut().pop_front() else {
            break;
        };
        let mut actions = Vec::new();
        {
            let mut inner = shared.inner.borrow_mut();
            let live = inner
                .clients
                .get(key)
                .is_some_and(|c| c.generation == generation);
            if live {
                process_event(&mut inner, key, event, &mut actions);
            }
        }
        run_actions(shared, actions);
    }

    shared.dispatching.set(false);
}

fn process_event(inner: &mut PoolInner, key: usize, event: PoolEvent, actions: &mut Vec<Action>) {
    match event {
        PoolEvent::Codec(CodecClientEvent::Connected) => {
            let client = &mut inner.clients[key];
            if client.state != ClientState::Connecting {
                return;
            }
            trace!(cluster = %inner.cluster.name, client = key, "connected");
            client.connect_timer = None;
            if let Some(mut span) = client.connect_span.take() {
                span.complete();
            }
            process_idle_client(inner, key, actions);
        }
        PoolEvent::Codec(CodecClientEvent::RemoteClose)
        | PoolEvent::Codec(CodecClientEvent::LocalClose) => {
            on_connection_closed(inner, key, actions);
        }
        PoolEvent::Codec(CodecClientEvent::ResponseComplete {
            saw_connection_close,
        }) => {
            on_response_complete(inner, key, saw_connection_close, actions);
        }
        PoolEvent::ConnectTimeout => {
            debug!(cluster = %inner.cluster.name, client = key, "connect timeout");
            inner.cluster.stats.upstream_cx_connect_timeout.inc();
            // Close with the connect marker still set; the close event takes
            // the connect-failure path and ejects the oldest pending request.
            inner.clients[key].codec.close();
        }
    }
}

/// A client finished connecting or finished a response: bind the oldest
/// pending request, or park it in the ready list.
fn process_idle_client(inner: &mut PoolInner, key: usize, actions: &mut Vec<Action>) {
    if let Some(mut request) = inner.pending_requests.pop_front() {
        inner.cluster.resources.pending_requests.dec();
        let client = &mut inner.clients[key];
        client.state = ClientState::Busy;
        if !inner.busy_clients.contains(&key) {
            inner.busy_clients.push(key);
        }
        let stream = client
            .codec
            .new_stream(request.decoder.take().expect("pending decoder consumed"));
        client.bound_stream = Some(stream.clone());
        actions.push(Action::Ready {
            callbacks: request.callbacks,
            stream,
        });
    } else {
        let client = &mut inner.clients[key];
        client.state = ClientState::Ready;
        inner.busy_clients.retain(|&k| k != key);
        if !inner.ready_clients.contains(&key) {
            inner.ready_clients.push(key);
        }
        check_for_drained(inner, actions);
    }
}

fn on_response_complete(
    inner: &mut PoolInner,
    key: usize,
    saw_connection_close: bool,
    actions: &mut Vec<Action>,
) {
    let max_requests = inner.cluster.max_requests_per_connection;
    let client = &mut inner.clients[key];
    if client.state != ClientState::Busy {
        return;
    }
    trace!(cluster = %inner.cluster.name, client = key, "response complete");
    client.bound_stream = None;
    client.requests_served += 1;

    let mut drain = saw_connection_close;
    if max_requests > 0 && client.requests_served >= max_requests {
        inner.cluster.stats.upstream_cx_max_requests.inc();
        drain = true;
    }

    if drain {
        // Protocol anomaly, not an error: finish out and close without
        // flushing.
        let client = &mut inner.clients[key];
        client.state = ClientState::Draining;
        client.codec.close();
    } else {
        process_idle_client(inner, key, actions);
    }
}

fn on_connection_closed(inner: &mut PoolInner, key: usize, actions: &mut Vec<Action>) {
    debug!(cluster = %inner.cluster.name, client = key, "client disconnected");
    inner.ready_clients.retain(|&k| k != key);
    inner.busy_clients.retain(|&k| k != key);

    let mut client = inner.clients.remove(key);

    // A stream still bound at close means the request was in flight; closes
    // already expected from draining cleared it at response completion.
    if let Some(stream) = client.bound_stream.take() {
        inner.cluster.stats.upstream_cx_destroy_with_active_rq.inc();
        actions.push(Action::ResetStream {
            stream,
            reason: StreamResetReason::ConnectionTermination,
        });
    }

    // Closed while the connect timer was armed: a connect failure. The
    // oldest pending request waiting on this client is ejected; a failure
    // callback may immediately issue a replacement request.
    if client.connect_timer.take().is_some() {
        inner.cluster.stats.upstream_cx_connect_fail.inc();
        if let Some(request) = inner.pending_requests.pop_front() {
            inner.cluster.resources.pending_requests.dec();
            inner.cluster.stats.upstream_rq_pending_failure_eject.inc();
            actions.push(Action::Failure {
                callbacks: request.callbacks,
                reason: PoolFailureReason::ConnectionFailure,
            });
        }
    }

    // The client never re-enters the pool; destruction is deferred so its
    // destructor cannot run inside this event.
    inner.dispatcher.deferred_delete(Box::new(client));

    check_for_drained(inner, actions);
}

fn check_for_drained(inner: &mut PoolInner, actions: &mut Vec<Action>) {
    if inner.drained_callbacks.is_empty() {
        return;
    }
    if !inner.pending_requests.is_empty() || !inner.busy_clients.is_empty() {
        return;
    }

    // Nothing in flight: idle clients have no reason to stay open.
    for key in inner.ready_clients.clone() {
        inner.clients[key].codec.close();
    }

    if inner.clients.is_empty() {
        actions.push(Action::Drained);
    }
}

fn run_actions(shared: &Rc<PoolShared>, actions: Vec<Action>) {
    for action in actions {
        match action {
            Action::Ready { callbacks, stream } => {
                callbacks.borrow_mut().on_pool_ready(stream);
            }
            Action::Failure { callbacks, reason } => {
                callbacks.borrow_mut().on_pool_failure(reason);
            }
            Action::ResetStream { stream, reason } => {
                stream.reset(reason);
            }
            Action::Drained => {
                let mut callbacks = std::mem::take(&mut shared.inner.borrow_mut().drained_callbacks);
                for cb in &mut callbacks {
                    cb();
                }
                let mut inner = shared.inner.borrow_mut();
                let mut added = std::mem::take(&mut inner.drained_callbacks);
                callbacks.append(&mut added);
                inner.drained_callbacks = callbacks;
            }
        }
    }
}

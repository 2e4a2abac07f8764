//! Per-worker connection handler.
//!
//! Owns every active listener and connection on a worker, wires accepted
//! connections to their filter chains, and runs the watchdog that flags a
//! stalled event loop.

use crate::address::Address;
use crate::connection::{Connection, ConnectionCloseType, ConnectionEvent, ConnectionState, FilterChainFactory};
use crate::listener::{ListenSocket, Listener, ListenerCallbacks, ListenerOptions};
use crate::ssl;
use event::{Dispatcher, Timer};
use slab::Slab;
use stats::{Counter, Gauge, Store, Timespan};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
const WATCHDOG_MISS: Duration = Duration::from_millis(200);
const WATCHDOG_MEGA_MISS: Duration = Duration::from_millis(1000);

/// Stats emitted per listener.
#[derive(Clone)]
pub struct ListenerStats {
    pub downstream_cx_total: Counter,
    pub downstream_cx_active: Gauge,
    pub downstream_cx_destroy: Counter,
    pub downstream_cx_length_ms: stats::Timer,
}

fn generate_listener_stats(prefix: &str, store: &Store) -> ListenerStats {
    ListenerStats {
        downstream_cx_total: store.counter(&format!("{}downstream_cx_total", prefix)),
        downstream_cx_active: store.gauge(&format!("{}downstream_cx_active", prefix)),
        downstream_cx_destroy: store.counter(&format!("{}downstream_cx_destroy", prefix)),
        downstream_cx_length_ms: store.timer(&format!("{}downstream_cx_length_ms", prefix)),
    }
}

struct ActiveListener {
    address: Address,
    listener: Option<Listener>,
    factory: Rc<dyn FilterChainFactory>,
    stats: ListenerStats,
}

struct ActiveConnection {
    connection: Connection,
    stats: ListenerStats,
    total_connections: Gauge,
    _length_span: Timespan,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.downstream_cx_active.dec();
        self.stats.downstream_cx_destroy.inc();
        self.total_connections.dec();
    }
}

struct HandlerInner {
    dispatcher: Rc<Dispatcher>,
    store: Store,
    listeners: Vec<ActiveListener>,
    connections: Slab<ActiveConnection>,
    total_connections: Gauge,
    watchdog_miss: Counter,
    watchdog_mega_miss: Counter,
    watchdog_timer: Option<Timer>,
    last_watchdog_time: Instant,
}

/// Handle to a worker's listener and connection registry.
#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Rc<RefCell<HandlerInner>>,
}

impl ConnectionHandler {
    pub fn new(dispatcher: Rc<Dispatcher>, store: Store) -> ConnectionHandler {
        let watchdog_miss = store.counter("server.watchdog_miss");
        let watchdog_mega_miss = store.counter("server.watchdog_mega_miss");
        let total_connections = store.gauge("server.total_connections");
        ConnectionHandler {
            inner: Rc::new(RefCell::new(HandlerInner {
                dispatcher,
                store,
                listeners: Vec::new(),
                connections: Slab::new(),
                total_connections,
                watchdog_miss,
                watchdog_mega_miss,
                watchdog_timer: None,
                last_watchdog_time: Instant::now(),
            })),
        }
    }

    pub fn add_listener(
        &self,
        factory: Rc<dyn FilterChainFactory>,
        socket: Arc<ListenSocket>,
        options: ListenerOptions,
    ) -> Listener {
        self.add_listener_impl(factory, socket, None, options)
    }

    pub fn add_ssl_listener(
        &self,
        factory: Rc<dyn FilterChainFactory>,
        ssl_ctx: Rc<dyn ssl::ServerContext>,
        socket: Arc<ListenSocket>,
        options: ListenerOptions,
    ) -> Listener {
        self.add_listener_impl(factory, socket, Some(ssl_ctx), options)
    }

    fn add_listener_impl(
        &self,
        factory: Rc<dyn FilterChainFactory>,
        socket: Arc<ListenSocket>,
        ssl_ctx: Option<Rc<dyn ssl::ServerContext>>,
        options: ListenerOptions,
    ) -> Listener {
        let address = socket.local_address();
        let (dispatcher, store) = {
            let inner = self.inner.borrow();
            (inner.dispatcher.clone(), inner.store.clone())
        };

        let index = self.inner.borrow().listeners.len();
        let callbacks = Rc::new(HandlerListenerCallbacks {
            handler: Rc::downgrade(&self.inner),
            index,
        });

        let listener = match ssl_ctx {
            Some(ctx) => Listener::new_ssl(&dispatcher, ctx, socket, callbacks, &store, options),
            None => Listener::new(&dispatcher, socket, callbacks, &store, options),
        };

        let weak = Rc::downgrade(&self.inner);
        listener.set_redirect_lookup(Rc::new(move |address| {
            weak.upgrade()
                .and_then(|inner| find_listener_by_address(&inner, address))
        }));

        let stats = generate_listener_stats(&format!("listener.{}.", address), &store);
        self.inner.borrow_mut().listeners.push(ActiveListener {
            address,
            listener: Some(listener.clone()),
            factory,
            stats,
        });
        listener
    }

    /// Exact address match, falling back to the same-port wildcard. Linear:
    /// listener counts are tiny.
    pub fn find_listener_by_address(&self, address: Address) -> Option<Listener> {
        find_listener_by_address(&self.inner, address)
    }

    /// Close every active connection and synchronously drain the deferred
    /// delete list. Worker shutdown.
    pub fn close_connections(&self) {
        loop {
            let front = {
                let inner = self.inner.borrow();
                inner
                    .connections
                    .iter()
                    .next()
                    .map(|(key, active)| (key, active.connection.clone()))
            };
            match front {
                Some((_, connection)) if connection.state() != ConnectionState::Closed => {
                    connection.close(ConnectionCloseType::NoFlush);
                }
                Some((key, _)) => {
                    // Already closed; make sure it leaves the registry.
                    remove_connection(&Rc::downgrade(&self.inner), key);
                }
                None => break,
            }
        }

        let dispatcher = self.inner.borrow().dispatcher.clone();
        dispatcher.clear_deferred_delete_list();
    }

    /// Drop listener handles; existing connections are untouched.
    pub fn close_listeners(&self) {
        for listener in &mut self.inner.borrow_mut().listeners {
            listener.listener = None;
        }
    }

    pub fn num_connections(&self) -> usize {
        self.inner.borrow().connections.len()
    }

    /// Arm the 100 ms loop-health timer. The miss counters are the only
    /// signal that this event loop is stalled.
    pub fn start_watchdog(&self) {
        let dispatcher = self.inner.borrow().dispatcher.clone();
        let weak = Rc::downgrade(&self.inner);
        let timer = dispatcher.create_timer(move || {
            if let Some(inner_rc) = weak.upgrade() {
                let mut inner = inner_rc.borrow_mut();
                let now = Instant::now();
                let delta = now - inner.last_watchdog_time;
                if delta > WATCHDOG_MISS {
                    inner.watchdog_miss.inc();
                }
                if delta > WATCHDOG_MEGA_MISS {
                    inner.watchdog_mega_miss.inc();
                }
                inner.last_watchdog_time = now;
                if let Some(timer) = &inner.watchdog_timer {
                    timer.enable(WATCHDOG_INTERVAL);
                }
            }
        });
        timer.enable(WATCHDOG_INTERVAL);

        let mut inner = self.inner.borrow_mut();
        inner.last_watchdog_time = Instant::now();
        inner.watchdog_timer = Some(timer);
    }
}

fn find_listener_by_address(
    inner: &Rc<RefCell<HandlerInner>>,
    address: Address,
) -> Option<Listener> {
    let inner = inner.borrow();
    if let Some(active) = inner.listeners.iter().find(|l| l.address == address) {
        return active.listener.clone();
    }
    inner
        .listeners
        .iter()
        .find(|l| l.address.port() == address.port() && l.address.is_wildcard())
        .and_then(|active| active.listener.clone())
}

struct HandlerListenerCallbacks {
    handler: Weak<RefCell<HandlerInner>>,
    index: usize,
}

impl ListenerCallbacks for HandlerListenerCallbacks {
    fn on_new_connection(&self, connection: Connection) {
        let Some(handler) = self.handler.upgrade() else {
            connection.close(ConnectionCloseType::NoFlush);
            return;
        };

        let (factory, stats, total_connections) = {
            let inner = handler.borrow();
            let active = &inner.listeners[self.index];
            (
                active.factory.clone(),
                active.stats.clone(),
                inner.total_connections.clone(),
            )
        };

        let empty_filter_chain = !factory.create_filter_chain(&connection);

        // The filter chain may have closed the connection already.
        if connection.state() == ConnectionState::Closed {
            return;
        }

        if empty_filter_chain {
            debug!(remote = %connection.remote_address(), "closing connection: no filters");
            connection.close(ConnectionCloseType::NoFlush);
            return;
        }

        connection.no_delay(true);
        stats.downstream_cx_total.inc();
        stats.downstream_cx_active.inc();
        total_connections.inc();
        let length_span = stats.downstream_cx_length_ms.allocate_span();

        let key = handler.borrow_mut().connections.insert(ActiveConnection {
            connection: connection.clone(),
            stats,
            total_connections,
            _length_span: length_span,
        });

        let weak = Rc::downgrade(&handler);
        connection.add_connection_callbacks(move |event| {
            if matches!(event, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose) {
                remove_connection(&weak, key);
            }
        });

        connection.initialize_read_filters();
    }
}

/// Move a connection out of the active registry and into the deferred
/// delete list; its destructor never runs inside the callback that closed
/// it.
fn remove_connection(handler: &Weak<RefCell<HandlerInner>>, key: usize) {
    let Some(inner_rc) = handler.upgrade() else {
        return;
    };
    let (removed, dispatcher) = {
        let mut inner = inner_rc.borrow_mut();
        let removed = inner.connections.try_remove(key);
        (removed, inner.dispatcher.clone())
    };
    if let Some(active) = removed {
        debug!(remote = %active.connection.remote_address(), "adding to cleanup list");
        dispatcher.deferred_delete(Box::new(active));
    }
}

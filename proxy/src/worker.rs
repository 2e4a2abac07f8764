//! Worker thread management.
//!
//! Each worker runs its own dispatcher and connection handler; workers
//! share nothing but the stat store and the upstream cluster descriptions.

use crate::connection::FilterChainFactory;
use crate::handler::ConnectionHandler;
use crate::listener::{ListenSocket, ListenerOptions};
use crate::tcp_proxy::TcpProxyFilterFactory;
use crate::upstream::ClusterInfo;
use event::{Dispatcher, DispatcherHandle, RunType, Timer};
use stats::Store;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One listener's worth of per-worker assembly input.
#[derive(Clone)]
pub struct WorkerListener {
    pub socket: Arc<ListenSocket>,
    pub options: ListenerOptions,
    pub cluster: Arc<ClusterInfo>,
}

/// Handle to a spawned worker thread.
pub struct WorkerHandle {
    pub worker_id: usize,
    pub dispatcher: DispatcherHandle,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker's loop to exit; `join` afterwards.
    pub fn exit(&self) {
        self.dispatcher.exit();
    }

    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// Spawn `num_workers` threads, each with a dispatcher, a handler, and the
/// full listener set. `drain` flips when the next generation asks this one
/// to stop accepting.
pub fn spawn_workers(
    num_workers: usize,
    cpu_affinity: Option<Vec<usize>>,
    listeners: Vec<WorkerListener>,
    store: Store,
    drain: Arc<AtomicBool>,
) -> Vec<WorkerHandle> {
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let cpu_id = cpu_affinity
            .as_ref()
            .map(|cpus| cpus[worker_id % cpus.len()]);
        let listeners = listeners.clone();
        let store = store.clone();
        let drain = drain.clone();
        let (handle_tx, handle_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || {
                if let Some(cpu) = cpu_id {
                    set_cpu_affinity(cpu);
                }
                run_worker(worker_id, listeners, store, drain, handle_tx);
            })
            .expect("failed to spawn worker thread");

        let dispatcher = handle_rx
            .recv()
            .expect("worker thread died during startup");

        handles.push(WorkerHandle {
            worker_id,
            dispatcher,
            thread,
        });
    }

    handles
}

fn run_worker(
    worker_id: usize,
    listeners: Vec<WorkerListener>,
    store: Store,
    drain: Arc<AtomicBool>,
    handle_tx: mpsc::Sender<DispatcherHandle>,
) {
    let dispatcher = Rc::new(Dispatcher::new());
    handle_tx
        .send(dispatcher.handle())
        .expect("main thread went away");

    let handler = ConnectionHandler::new(dispatcher.clone(), store);
    for listener in &listeners {
        let factory: Rc<dyn FilterChainFactory> = Rc::new(TcpProxyFilterFactory::new(
            dispatcher.clone(),
            listener.cluster.clone(),
        ));
        handler.add_listener(factory, listener.socket.clone(), listener.options.clone());
    }
    handler.start_watchdog();

    // Periodic tick: picks up the drain request and keeps the loop from
    // ever going idle-empty.
    let tick: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
    let tick2 = tick.clone();
    let handler2 = handler.clone();
    let timer = dispatcher.create_timer(move || {
        if drain.load(Ordering::SeqCst) {
            handler2.close_listeners();
        }
        if let Some(timer) = tick2.borrow().as_ref() {
            timer.enable(DRAIN_POLL_INTERVAL);
        }
    });
    timer.enable(DRAIN_POLL_INTERVAL);
    *tick.borrow_mut() = Some(timer);

    info!(worker_id, "worker entering dispatch loop");
    dispatcher.run(RunType::RunUntilExit);
    info!(worker_id, "worker exited dispatch loop");

    // Close all connections before the thread dies so destructors never run
    // on the main thread.
    handler.close_connections();
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpu: usize) {}

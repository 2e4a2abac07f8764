//! Server bootstrap.
//!
//! Brings up the hot-restart coordinator, acquires listen sockets (from the
//! previous generation when possible, binding otherwise), starts workers,
//! and runs the main-thread dispatcher that serves hot-restart RPCs until
//! shutdown.

use crate::address::Address;
use crate::config::Config;
use crate::listener::{ListenSocket, ListenerOptions};
use crate::upstream::{ClusterInfo, ResourceManager};
use crate::worker::{WorkerListener, spawn_workers};
use ahash::AHashMap;
use event::{Dispatcher, RunType, Timer};
use restart::{HotRestart, HotRestartServer, ParentStats};
use stats::Store;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process identity flags consumed by the core.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Selects the shared-memory and domain-socket namespace.
    pub base_id: u32,
    /// Hot-restart generation; zero means a fresh start.
    pub restart_epoch: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    HotRestart(#[from] restart::Error),
    #[error("cannot listen on socket: {address}: {source}")]
    Listen {
        address: Address,
        source: std::io::Error,
    },
}

/// Run the server until `shutdown` flips. Blocks the calling thread.
pub fn run(config: &Config, options: Options, shutdown: Arc<AtomicBool>) -> Result<(), ServerError> {
    let hot_restart = Rc::new(HotRestart::new(options.base_id, options.restart_epoch)?);
    info!(
        restart_epoch = options.restart_epoch,
        hot_restart_version = %hot_restart.version(),
        "starting"
    );

    let store = Store::new(Arc::new(hot_restart.stat_allocator()));

    // Uptime is measured from the first generation.
    let original_start_time = hot_restart
        .shutdown_parent_admin()
        .unwrap_or_else(unix_time);

    let mut clusters: AHashMap<String, Arc<ClusterInfo>> = AHashMap::new();
    for c in &config.clusters {
        let resources = ResourceManager::new(
            c.max_connections,
            c.max_pending_requests,
            c.max_requests,
            c.max_retries,
        );
        clusters.insert(
            c.name.clone(),
            Arc::new(ClusterInfo::new(
                &c.name,
                c.address,
                Duration::from_millis(c.connect_timeout_ms),
                c.per_connection_buffer_limit,
                c.max_requests_per_connection,
                resources,
                &store,
            )),
        );
    }

    let mut worker_listeners = Vec::with_capacity(config.listeners.len());
    for l in &config.listeners {
        let socket = match hot_restart.duplicate_parent_listen_socket(&l.address.as_url()) {
            Some(fd) => {
                info!(address = %l.address, "took over listen socket from previous generation");
                ListenSocket::from_fd(fd).map_err(|source| ServerError::Listen {
                    address: l.address,
                    source,
                })?
            }
            None => ListenSocket::bind(l.address).map_err(|source| ServerError::Listen {
                address: l.address,
                source,
            })?,
        };
        worker_listeners.push(WorkerListener {
            socket: Arc::new(socket),
            options: ListenerOptions {
                bind_to_port: l.bind_to_port,
                use_proxy_proto: l.use_proxy_proto,
                use_original_dst: l.use_original_dst,
                per_connection_buffer_limit: l.per_connection_buffer_limit,
            },
            cluster: clusters[&l.route].clone(),
        });
    }

    let drain = Arc::new(AtomicBool::new(false));
    let workers = spawn_workers(
        config.threads(),
        config.cpu_affinity(),
        worker_listeners.clone(),
        store.clone(),
        drain.clone(),
    );
    info!(workers = workers.len(), "workers started");

    // All listeners are up; the previous generation can stop accepting.
    hot_restart.drain_parent_listeners();

    let dispatcher = Rc::new(Dispatcher::new());
    let server: Rc<dyn HotRestartServer> = Rc::new(ServerImpl {
        sockets: worker_listeners.iter().map(|w| w.socket.clone()).collect(),
        store: store.clone(),
        drain: drain.clone(),
        original_start_time,
    });
    hot_restart.clone().initialize(&dispatcher, server);

    // The old generation keeps draining for a grace period, then goes away.
    let hot_restart2 = hot_restart.clone();
    let terminate_timer = dispatcher.create_timer(move || {
        hot_restart2.terminate_parent();
    });
    if options.restart_epoch != 0 {
        terminate_timer.enable(Duration::from_secs(config.server.parent_shutdown_secs));
    }

    let poll: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
    let poll2 = poll.clone();
    let dispatcher2 = dispatcher.clone();
    let shutdown2 = shutdown.clone();
    let shutdown_timer = dispatcher.create_timer(move || {
        if shutdown2.load(Ordering::SeqCst) {
            dispatcher2.exit();
        } else if let Some(timer) = poll2.borrow().as_ref() {
            timer.enable(SHUTDOWN_POLL_INTERVAL);
        }
    });
    shutdown_timer.enable(SHUTDOWN_POLL_INTERVAL);
    *poll.borrow_mut() = Some(shutdown_timer);

    dispatcher.run(RunType::RunUntilExit);

    info!("shutting down workers");
    for worker in &workers {
        worker.exit();
    }
    for worker in workers {
        worker.join();
    }
    info!("shutdown complete");
    Ok(())
}

struct ServerImpl {
    sockets: Vec<Arc<ListenSocket>>,
    store: Store,
    drain: Arc<AtomicBool>,
    original_start_time: u64,
}

impl HotRestartServer for ServerImpl {
    fn listen_socket_fd(&self, address: &str) -> Option<RawFd> {
        self.sockets
            .iter()
            .find(|s| s.local_address().as_url() == address)
            .map(|s| s.fd())
    }

    fn drain_listeners(&self) {
        info!("draining listeners due to hot restart");
        self.drain.store(true, Ordering::SeqCst);
    }

    fn shutdown_admin(&self) {
        // Admin endpoint content lives outside the core; nothing to stop.
    }

    fn original_start_time(&self) -> u64 {
        self.original_start_time
    }

    fn stats_snapshot(&self) -> ParentStats {
        ParentStats {
            memory_allocated: 0,
            num_connections: self.store.gauge("server.total_connections").value(),
        }
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

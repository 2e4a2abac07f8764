//! Upstream cluster description and stats.

use crate::address::Address;
use crate::upstream::resource::ResourceManager;
use stats::{Counter, Gauge, Store};
use std::time::Duration;

/// Cluster-scoped counters and timers the pool emits.
#[derive(Clone)]
pub struct ClusterStats {
    pub upstream_cx_total: Counter,
    pub upstream_cx_active: Gauge,
    pub upstream_cx_destroy: Counter,
    pub upstream_cx_connect_fail: Counter,
    pub upstream_cx_connect_timeout: Counter,
    pub upstream_cx_overflow: Counter,
    pub upstream_cx_max_requests: Counter,
    pub upstream_cx_destroy_with_active_rq: Counter,
    pub upstream_rq_pending_overflow: Counter,
    pub upstream_rq_pending_failure_eject: Counter,
    pub upstream_cx_connect_ms: stats::Timer,
    pub upstream_cx_length_ms: stats::Timer,
}

impl ClusterStats {
    fn generate(prefix: &str, store: &Store) -> ClusterStats {
        ClusterStats {
            upstream_cx_total: store.counter(&format!("{}upstream_cx_total", prefix)),
            upstream_cx_active: store.gauge(&format!("{}upstream_cx_active", prefix)),
            upstream_cx_destroy: store.counter(&format!("{}upstream_cx_destroy", prefix)),
            upstream_cx_connect_fail: store.counter(&format!("{}upstream_cx_connect_fail", prefix)),
            upstream_cx_connect_timeout: store
                .counter(&format!("{}upstream_cx_connect_timeout", prefix)),
            upstream_cx_overflow: store.counter(&format!("{}upstream_cx_overflow", prefix)),
            upstream_cx_max_requests: store.counter(&format!("{}upstream_cx_max_requests", prefix)),
            upstream_cx_destroy_with_active_rq: store
                .counter(&format!("{}upstream_cx_destroy_with_active_rq", prefix)),
            upstream_rq_pending_overflow: store
                .counter(&format!("{}upstream_rq_pending_overflow", prefix)),
            upstream_rq_pending_failure_eject: store
                .counter(&format!("{}upstream_rq_pending_failure_eject", prefix)),
            upstream_cx_connect_ms: store.timer(&format!("{}upstream_cx_connect_ms", prefix)),
            upstream_cx_length_ms: store.timer(&format!("{}upstream_cx_length_ms", prefix)),
        }
    }
}

/// Everything the pool needs to know about one upstream cluster. Shared by
/// every worker.
pub struct ClusterInfo {
    pub name: String,
    pub address: Address,
    pub connect_timeout: Duration,
    pub per_connection_buffer_limit: usize,
    /// Zero means unlimited.
    pub max_requests_per_connection: u64,
    pub resources: ResourceManager,
    pub stats: ClusterStats,
}

impl ClusterInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        address: Address,
        connect_timeout: Duration,
        per_connection_buffer_limit: usize,
        max_requests_per_connection: u64,
        resources: ResourceManager,
        store: &Store,
    ) -> ClusterInfo {
        let stats = ClusterStats::generate(&format!("cluster.{}.", name), store);
        ClusterInfo {
            name: name.to_string(),
            address,
            connect_timeout,
            per_connection_buffer_limit,
            max_requests_per_connection,
            resources,
            stats,
        }
    }
}

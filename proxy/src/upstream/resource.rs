//! Cluster-scoped resource limits.
//!
//! The pool consults these on every admission decision. Counts are atomic:
//! one cluster is shared by every worker's pool.

use std::sync::atomic::{AtomicU64, Ordering};

/// One bounded resource.
pub struct Resource {
    max: u64,
    current: AtomicU64,
}

impl Resource {
    pub fn new(max: u64) -> Resource {
        Resource {
            max,
            current: AtomicU64::new(0),
        }
    }

    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Relaxed) < self.max
    }

    pub fn inc(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let prev = self.current.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    pub fn count(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

/// The limit set for one cluster.
pub struct ResourceManager {
    pub connections: Resource,
    pub pending_requests: Resource,
    pub requests: Resource,
    pub retries: Resource,
}

impl ResourceManager {
    pub fn new(
        max_connections: u64,
        max_pending_requests: u64,
        max_requests: u64,
        max_retries: u64,
    ) -> ResourceManager {
        ResourceManager {
            connections: Resource::new(max_connections),
            pending_requests: Resource::new(max_pending_requests),
            requests: Resource::new(max_requests),
            retries: Resource::new(max_retries),
        }
    }
}

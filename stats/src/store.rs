//! The stat store: named counters, gauges, and timers.

use crate::allocator::{StatDataAllocator, StatRef};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::warn;

/// Receives completed timing values. Fan-out targets (statsd, etc.) live
/// behind this interface.
pub trait Sink: Send + Sync {
    fn on_timing(&self, name: &str, ms: u64);
}

struct StatHandle {
    data: StatRef,
    allocator: Arc<dyn StatDataAllocator>,
}

impl Drop for StatHandle {
    fn drop(&mut self) {
        self.allocator.free(self.data);
    }
}

struct StoreInner {
    allocator: Arc<dyn StatDataAllocator>,
    // Name -> live handle, so repeated lookups share one allocator ref.
    stats: Mutex<HashMap<String, Arc<StatHandle>>>,
    sinks: RwLock<Vec<Box<dyn Sink>>>,
}

/// Allocates and caches named stats. Cloning shares the underlying store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(allocator: Arc<dyn StatDataAllocator>) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                allocator,
                stats: Mutex::new(HashMap::new()),
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn counter(&self, name: &str) -> Counter {
        Counter {
            handle: self.handle(name),
        }
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        Gauge {
            handle: self.handle(name),
        }
    }

    pub fn timer(&self, name: &str) -> Timer {
        Timer {
            name: Arc::from(name),
            inner: self.inner.clone(),
        }
    }

    pub fn add_sink(&self, sink: Box<dyn Sink>) {
        self.inner.sinks.write().push(sink);
    }

    fn handle(&self, name: &str) -> Arc<StatHandle> {
        let mut stats = self.inner.stats.lock();
        if let Some(handle) = stats.get(name) {
            return handle.clone();
        }

        let data = self.inner.allocator.alloc(name).unwrap_or_else(|| {
            // Slot exhaustion: fall back to an anonymous heap slot rather
            // than failing the caller. The stat will not survive restart.
            warn!(name, "stat slot allocation failed, using heap fallback");
            static FALLBACK: std::sync::OnceLock<Arc<crate::HeapStatDataAllocator>> =
                std::sync::OnceLock::new();
            FALLBACK
                .get_or_init(|| Arc::new(crate::HeapStatDataAllocator::new()))
                .alloc(name)
                .expect("heap stat allocation cannot fail")
        });

        let handle = Arc::new(StatHandle {
            data,
            allocator: self.inner.allocator.clone(),
        });
        stats.insert(name.to_string(), handle.clone());
        handle
    }

    fn deliver_timing(&self, name: &str, ms: u64) {
        for sink in self.inner.sinks.read().iter() {
            sink.on_timing(name, ms);
        }
    }
}

/// Monotonic counter.
#[derive(Clone)]
pub struct Counter {
    handle: Arc<StatHandle>,
}

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, amount: u64) {
        self.handle
            .data
            .get()
            .counter_value
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.handle.data.get().counter_value.load(Ordering::Relaxed)
    }
}

/// Up/down gauge.
#[derive(Clone)]
pub struct Gauge {
    handle: Arc<StatHandle>,
}

impl Gauge {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    pub fn add(&self, amount: u64) {
        self.handle
            .data
            .get()
            .gauge_value
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn sub(&self, amount: u64) {
        self.handle
            .data
            .get()
            .gauge_value
            .fetch_sub(amount, Ordering::Relaxed);
    }

    pub fn set(&self, value: u64) {
        self.handle
            .data
            .get()
            .gauge_value
            .store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.handle.data.get().gauge_value.load(Ordering::Relaxed)
    }
}

/// Named timing stat; measurement happens through [`Timespan`]s.
#[derive(Clone)]
pub struct Timer {
    name: Arc<str>,
    inner: Arc<StoreInner>,
}

impl Timer {
    /// Start a span. The elapsed time is recorded when the span completes
    /// (or is dropped), so every exit path reports.
    pub fn allocate_span(&self) -> Timespan {
        Timespan {
            timer: self.clone(),
            start: Instant::now(),
            completed: false,
        }
    }
}

/// RAII timing measurement.
pub struct Timespan {
    timer: Timer,
    start: Instant,
    completed: bool,
}

impl Timespan {
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let ms = self.start.elapsed().as_millis() as u64;
        let store = Store {
            inner: self.timer.inner.clone(),
        };
        store.deliver_timing(&self.timer.name, ms);
    }
}

impl Drop for Timespan {
    fn drop(&mut self) {
        self.complete();
    }
}

//! Stat storage.
//!
//! Stats live in fixed-layout [`RawStatData`] slots so the same slot type
//! works both on the process heap and inside the shared-memory region that
//! survives hot restarts. A [`Store`] hands out cheap cloneable counter,
//! gauge, and timer handles backed by slots from a [`StatDataAllocator`].

mod allocator;
mod store;

pub use allocator::{HeapStatDataAllocator, MAX_NAME_SIZE, RawStatData, StatDataAllocator, StatRef};
pub use store::{Counter, Gauge, Sink, Store, Timer, Timespan};

//! Raw stat slots and allocators.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

/// Maximum stat name length in bytes. Longer names are truncated; matching
/// compares the truncated prefix so every process using a region agrees.
pub const MAX_NAME_SIZE: usize = 127;

/// One stat slot. Laid out directly into shared memory, so the layout is
/// fixed: any change requires bumping the region version.
#[repr(C)]
pub struct RawStatData {
    pub ref_count: u32,
    pub name: [u8; MAX_NAME_SIZE + 1],
    pub counter_value: AtomicU64,
    pub gauge_value: AtomicU64,
}

impl RawStatData {
    /// A slot is initialized exactly while its name is non-empty.
    pub fn initialized(&self) -> bool {
        self.name[0] != 0
    }

    /// Claim a free slot for `name` with a reference count of one.
    pub fn initialize(&mut self, name: &str) {
        debug_assert!(!self.initialized());
        self.ref_count = 1;
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_SIZE);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len] = 0;
    }

    /// Compare against the truncated prefix of `name`.
    pub fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_SIZE);
        self.name[len] == 0 && self.name[..len] == bytes[..len]
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_bytes()).unwrap_or("")
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        &self.name[..len]
    }

    /// Return the slot to the free state.
    pub fn zero(&mut self) {
        self.ref_count = 0;
        self.name = [0; MAX_NAME_SIZE + 1];
        self.counter_value = AtomicU64::new(0);
        self.gauge_value = AtomicU64::new(0);
    }
}

/// Reference to a stat slot owned by an allocator.
///
/// The slot may live on the heap or in a shared-memory mapping; either way
/// it is pinned for the lifetime of the allocator and freed only through it.
#[derive(Clone, Copy)]
pub struct StatRef(NonNull<RawStatData>);

// Counter and gauge values are atomics; the name and ref count are only
// mutated under the owning allocator's lock.
unsafe impl Send for StatRef {}
unsafe impl Sync for StatRef {}

impl StatRef {
    /// # Safety
    /// `ptr` must point to a `RawStatData` that outlives every use of the
    /// returned reference.
    pub unsafe fn new(ptr: NonNull<RawStatData>) -> StatRef {
        StatRef(ptr)
    }

    pub fn get(&self) -> &RawStatData {
        unsafe { self.0.as_ref() }
    }

    /// Raw slot pointer, for allocators that mutate the name and reference
    /// count under their own lock.
    pub fn as_ptr(&self) -> NonNull<RawStatData> {
        self.0
    }
}

/// Hands out named stat slots with reference counting: repeated allocations
/// of one name return the same slot.
pub trait StatDataAllocator: Send + Sync {
    /// Allocate (or re-reference) the slot for `name`. `None` when the
    /// backing storage is exhausted.
    fn alloc(&self, name: &str) -> Option<StatRef>;

    /// Drop one reference; the slot becomes reusable at zero.
    fn free(&self, data: StatRef);
}

/// Process-local allocator. Used when stats do not need to survive a hot
/// restart; observable behavior matches the shared-memory allocator.
#[derive(Default)]
pub struct HeapStatDataAllocator {
    slots: Mutex<HashMap<Vec<u8>, StatRef>>,
}

impl HeapStatDataAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatDataAllocator for HeapStatDataAllocator {
    fn alloc(&self, name: &str) -> Option<StatRef> {
        let mut slots = self.slots.lock();
        let bytes = name.as_bytes();
        let truncated = bytes[..bytes.len().min(MAX_NAME_SIZE)].to_vec();
        if let Some(stat) = slots.get(&truncated) {
            let stat = *stat;
            unsafe {
                (*stat.as_ptr().as_ptr()).ref_count += 1;
            }
            return Some(stat);
        }

        let mut data = Box::new(RawStatData {
            ref_count: 0,
            name: [0; MAX_NAME_SIZE + 1],
            counter_value: AtomicU64::new(0),
            gauge_value: AtomicU64::new(0),
        });
        data.initialize(name);
        let ptr = NonNull::new(Box::into_raw(data)).unwrap();
        let stat = unsafe { StatRef::new(ptr) };
        slots.insert(truncated, stat);
        Some(stat)
    }

    fn free(&self, data: StatRef) {
        let mut slots = self.slots.lock();
        let raw = data.as_ptr().as_ptr();
        unsafe {
            debug_assert!((*raw).ref_count > 0);
            (*raw).ref_count -= 1;
            if (*raw).ref_count == 0 {
                slots.remove((*raw).name_bytes());
                drop(Box::from_raw(raw));
            }
        }
    }
}

impl Drop for HeapStatDataAllocator {
    fn drop(&mut self) {
        // Outstanding handles keep the allocator alive through their Arc, so
        // anything left here is a leaked slot; reclaim it.
        for (_, stat) in self.slots.lock().drain() {
            unsafe {
                drop(Box::from_raw(stat.as_ptr().as_ptr()));
            }
        }
    }
}

//! The shared-memory region laid out across process generations.

use memmap2::{MmapMut, MmapOptions};
use stats::RawStatData;
use std::ffi::CString;
use std::fs::File;
use std::mem::size_of;
use std::os::unix::io::FromRawFd;

/// Incremented on every layout or RPC change that would prevent a hot
/// restart from working. A mismatching predecessor is a refuse-to-start so
/// the operator falls back to a full restart.
pub const VERSION: u64 = 5;

/// Stat slots available in the region.
pub const NUM_STAT_SLOTS: usize = 16384;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open shared memory region {name}, check user permissions: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },
    #[error("cannot size shared memory region {name}: {source}")]
    Truncate {
        name: String,
        source: std::io::Error,
    },
    #[error("cannot map shared memory region {name}: {source}")]
    Map {
        name: String,
        source: std::io::Error,
    },
    #[error(
        "shared memory version mismatch in {name} (found {found_version}/{found_size} bytes, \
         expected {expected_version}/{expected_size} bytes), a full restart is required"
    )]
    VersionMismatch {
        name: String,
        found_version: u64,
        found_size: u64,
        expected_version: u64,
        expected_size: u64,
    },
    #[error("unable to bind domain socket with id={id} (see --base-id option)")]
    BindDomainSocket { id: u64 },
}

/// The region contents. Laid directly into the mapping and shared by every
/// running generation; the field order is wire format.
#[repr(C)]
pub struct SharedMemory {
    pub size: u64,
    pub version: u64,
    log_lock: libc::pthread_mutex_t,
    access_log_lock: libc::pthread_mutex_t,
    stat_lock: libc::pthread_mutex_t,
    stats_slots: [RawStatData; NUM_STAT_SLOTS],
}

/// Owned mapping of the region for one process.
pub struct SharedMemoryHandle {
    name: String,
    ptr: *mut SharedMemory,
    _map: MmapMut,
}

// The mapping is stable for the handle's lifetime. Slot values are atomics;
// names, ref counts, and mutex state are only touched under the in-region
// process-shared locks.
unsafe impl Send for SharedMemoryHandle {}
unsafe impl Sync for SharedMemoryHandle {}

impl SharedMemoryHandle {
    /// Open (epoch > 0) or create (epoch 0) the region for `base_id`.
    pub fn initialize(base_id: u32, restart_epoch: u32) -> Result<SharedMemoryHandle, Error> {
        let name = format!("/bloomery_shared_memory_{}", base_id);
        let cname = CString::new(name.clone()).expect("region name contains NUL");

        let mut oflags = libc::O_RDWR;
        if restart_epoch == 0 {
            oflags |= libc::O_CREAT | libc::O_EXCL;
            // If we are meant to be first, clear out any previous instance
            // so the exclusive create below can succeed.
            unsafe {
                libc::shm_unlink(cname.as_ptr());
            }
        }

        let fd = unsafe { libc::shm_open(cname.as_ptr(), oflags, 0o600) };
        if fd == -1 {
            return Err(Error::Open {
                name,
                source: std::io::Error::last_os_error(),
            });
        }
        let file = unsafe { File::from_raw_fd(fd) };

        if restart_epoch == 0 {
            file.set_len(size_of::<SharedMemory>() as u64)
                .map_err(|source| Error::Truncate {
                    name: name.clone(),
                    source,
                })?;
        }

        let mut map = unsafe {
            MmapOptions::new()
                .len(size_of::<SharedMemory>())
                .map_mut(&file)
        }
        .map_err(|source| Error::Map {
            name: name.clone(),
            source,
        })?;

        let ptr = map.as_mut_ptr() as *mut SharedMemory;

        unsafe {
            if restart_epoch == 0 {
                (*ptr).size = size_of::<SharedMemory>() as u64;
                (*ptr).version = VERSION;
                initialize_mutex(&raw mut (*ptr).log_lock);
                initialize_mutex(&raw mut (*ptr).access_log_lock);
                initialize_mutex(&raw mut (*ptr).stat_lock);
            } else if (*ptr).size != size_of::<SharedMemory>() as u64 || (*ptr).version != VERSION {
                return Err(Error::VersionMismatch {
                    name,
                    found_version: (*ptr).version,
                    found_size: (*ptr).size,
                    expected_version: VERSION,
                    expected_size: size_of::<SharedMemory>() as u64,
                });
            }
        }

        Ok(SharedMemoryHandle {
            name,
            ptr,
            _map: map,
        })
    }

    /// Human-readable version tag: layout version plus region size.
    pub fn version_string(&self) -> String {
        format!("{}.{}", VERSION, size_of::<SharedMemory>())
    }

    pub fn log_lock(&self) -> ProcessSharedMutex {
        ProcessSharedMutex {
            mutex: unsafe { &raw mut (*self.ptr).log_lock },
        }
    }

    pub fn access_log_lock(&self) -> ProcessSharedMutex {
        ProcessSharedMutex {
            mutex: unsafe { &raw mut (*self.ptr).access_log_lock },
        }
    }

    pub fn stat_lock(&self) -> ProcessSharedMutex {
        ProcessSharedMutex {
            mutex: unsafe { &raw mut (*self.ptr).stat_lock },
        }
    }

    pub(crate) fn slot(&self, index: usize) -> *mut RawStatData {
        debug_assert!(index < NUM_STAT_SLOTS);
        unsafe { (&raw mut (*self.ptr).stats_slots).cast::<RawStatData>().add(index) }
    }

    /// Remove the region name from the namespace. The mapping stays valid;
    /// used by tests and a final clean shutdown.
    pub fn unlink(&self) {
        let cname = CString::new(self.name.clone()).expect("region name contains NUL");
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
    }
}

unsafe fn initialize_mutex(mutex: *mut libc::pthread_mutex_t) {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        libc::pthread_mutexattr_init(&mut attr);
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
    }
}

/// Lock handle over a process-shared robust pthread mutex living in the
/// region.
#[derive(Clone, Copy)]
pub struct ProcessSharedMutex {
    mutex: *mut libc::pthread_mutex_t,
}

unsafe impl Send for ProcessSharedMutex {}
unsafe impl Sync for ProcessSharedMutex {}

impl ProcessSharedMutex {
    /// Lock, recovering consistency if the previous owner died while
    /// holding the mutex.
    pub fn lock(&self) -> ProcessSharedMutexGuard<'_> {
        unsafe {
            let rc = libc::pthread_mutex_lock(self.mutex);
            if rc == libc::EOWNERDEAD {
                libc::pthread_mutex_consistent(self.mutex);
            } else {
                debug_assert_eq!(rc, 0);
            }
        }
        ProcessSharedMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<ProcessSharedMutexGuard<'_>> {
        unsafe {
            let rc = libc::pthread_mutex_trylock(self.mutex);
            if rc == libc::EBUSY {
                return None;
            }
            if rc == libc::EOWNERDEAD {
                libc::pthread_mutex_consistent(self.mutex);
            } else {
                debug_assert_eq!(rc, 0);
            }
        }
        Some(ProcessSharedMutexGuard { mutex: self })
    }
}

pub struct ProcessSharedMutexGuard<'a> {
    mutex: &'a ProcessSharedMutex,
}

impl Drop for ProcessSharedMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.mutex);
        }
    }
}

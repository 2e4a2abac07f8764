//! Hot restart.
//!
//! Lets an incoming process generation (restart epoch N+1) take over listen
//! sockets and inherit global stats from a running predecessor (epoch N)
//! without dropping accepted connections. State crosses the process boundary
//! two ways: a versioned shared-memory region holding stat slots behind
//! process-shared robust mutexes, and a datagram RPC over anonymous Unix
//! sockets that can carry listen-socket file descriptors as ancillary data.

mod coordinator;
mod rpc;
mod shmem;

pub use coordinator::{
    HotRestart, HotRestartServer, MAX_CONCURRENT_PROCESSES, ParentStats, SharedStatAllocator,
};
pub use rpc::{RpcError, RpcMessage};
pub use shmem::{
    Error, NUM_STAT_SLOTS, ProcessSharedMutex, ProcessSharedMutexGuard, SharedMemoryHandle, VERSION,
};

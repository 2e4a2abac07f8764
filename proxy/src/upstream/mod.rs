//! Upstream clusters and connection pooling.

pub mod cluster;
pub mod codec;
pub mod conn_pool;
pub mod resource;

pub use cluster::{ClusterInfo, ClusterStats};
pub use codec::{
    CodecClient, CodecClientEvent, CodecClientEventSink, CodecClientFactory, Http1CodecClientFactory,
    ResponseDecoder, StreamHandle, StreamResetReason,
};
pub use conn_pool::{ConnPool, PendingRequestHandle, PoolCallbacks, PoolFailureReason};
pub use resource::{Resource, ResourceManager};

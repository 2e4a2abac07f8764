//! Built-in L4 proxy filter.
//!
//! Shuttles bytes between a downstream connection and a fresh upstream
//! connection to the routed cluster, propagating close in both directions.
//! Richer routing and the filter-chain configuration surface live outside
//! this repository.

use crate::connection::{
    Connection, ConnectionCloseType, ConnectionEvent, FilterChainFactory, FilterStatus, ReadFilter,
    WeakConnection,
};
use crate::upstream::ClusterInfo;
use bytes::BytesMut;
use event::Dispatcher;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

/// Installs a [`TcpProxy`] on every accepted connection.
pub struct TcpProxyFilterFactory {
    dispatcher: Rc<Dispatcher>,
    cluster: Arc<ClusterInfo>,
}

impl TcpProxyFilterFactory {
    pub fn new(dispatcher: Rc<Dispatcher>, cluster: Arc<ClusterInfo>) -> TcpProxyFilterFactory {
        TcpProxyFilterFactory {
            dispatcher,
            cluster,
        }
    }
}

impl FilterChainFactory for TcpProxyFilterFactory {
    fn create_filter_chain(&self, connection: &Connection) -> bool {
        connection.add_read_filter(Box::new(TcpProxy {
            dispatcher: self.dispatcher.clone(),
            cluster: self.cluster.clone(),
            downstream: connection.downgrade(),
            upstream: None,
        }));
        true
    }
}

/// The per-connection filter.
pub struct TcpProxy {
    dispatcher: Rc<Dispatcher>,
    cluster: Arc<ClusterInfo>,
    downstream: WeakConnection,
    upstream: Option<Connection>,
}

impl ReadFilter for TcpProxy {
    fn on_new_connection(&mut self) -> FilterStatus {
        let upstream = match Connection::connect(&self.dispatcher, self.cluster.address) {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(cluster = %self.cluster.name, error = %e, "upstream connect failed");
                if let Some(downstream) = self.downstream.upgrade() {
                    downstream.close(ConnectionCloseType::NoFlush);
                }
                return FilterStatus::StopIteration;
            }
        };
        self.cluster.stats.upstream_cx_total.inc();
        upstream.set_read_buffer_limit(self.cluster.per_connection_buffer_limit);
        upstream.no_delay(true);

        // Upstream bytes flow straight back downstream.
        upstream.add_read_filter(Box::new(UpstreamRelay {
            downstream: self.downstream.clone(),
        }));

        // Close propagation, both directions. Weak captures only: the
        // upstream is owned by this filter, which the downstream owns.
        let downstream = self.downstream.clone();
        upstream.add_connection_callbacks(move |event| {
            if matches!(event, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose)
                && let Some(downstream) = downstream.upgrade()
            {
                trace!("upstream closed, closing downstream");
                downstream.close(ConnectionCloseType::FlushWrite);
            }
        });

        let upstream_weak = upstream.downgrade();
        if let Some(downstream) = self.downstream.upgrade() {
            downstream.add_connection_callbacks(move |event| {
                if matches!(event, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose)
                    && let Some(upstream) = upstream_weak.upgrade()
                {
                    upstream.close(ConnectionCloseType::FlushWrite);
                }
            });
        }

        self.upstream = Some(upstream);
        FilterStatus::Continue
    }

    fn on_data(&mut self, data: &mut BytesMut) -> FilterStatus {
        if let Some(upstream) = &self.upstream {
            let chunk = data.split_to(data.len());
            upstream.write(&chunk);
        }
        FilterStatus::Continue
    }
}

struct UpstreamRelay {
    downstream: WeakConnection,
}

impl ReadFilter for UpstreamRelay {
    fn on_data(&mut self, data: &mut BytesMut) -> FilterStatus {
        if let Some(downstream) = self.downstream.upgrade() {
            let chunk = data.split_to(data.len());
            downstream.write(&chunk);
        }
        FilterStatus::Continue
    }
}

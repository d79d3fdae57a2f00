//! Transport engine configuration.
//!
//! All capacity limits and tuning knobs consumed by the engine live here;
//! the stack's configuration loader fills this struct in and hands it to
//! [`TransportManager::new`](crate::manager::TransportManager::new).

use std::time::Duration;

// Maximum UDP payload; also the default pooled receive buffer size.
const MAX_UDP_PACKET_SIZE: usize = 65_507;

/// Configuration for the transport engine
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Size of each receive buffer and of the UDP send buffer.
    ///
    /// Messages longer than this are rejected with `InsufficientBuffer`.
    pub max_buffer_size: usize,

    /// Number of worker tasks draining the event queue.
    ///
    /// `0` spawns no pool; the owner drains the queue inline through
    /// [`TransportManager::dispatch_one`](crate::manager::TransportManager::dispatch_one).
    pub worker_tasks: usize,

    /// Capacity of the event-cell pool (bounds the dispatch queue).
    pub event_queue_capacity: usize,

    /// Capacity of the receive-buffer pool.
    pub recv_buffer_pool_capacity: usize,

    /// Maximum number of live connections.
    pub max_connections: usize,

    /// Maximum number of bound local addresses.
    pub max_local_addresses: usize,

    /// Maximum datagrams handled per UDP readiness burst before yielding,
    /// so one flooded socket cannot starve the others.
    pub udp_drain_budget: usize,

    /// Reopen a UDP socket after an unexpected receive/send error.
    pub reopen_on_socket_error: bool,

    /// Timeout for outbound stream connects.
    pub connect_timeout: Duration,

    /// TLS settings; required for TLS connections.
    #[cfg(feature = "tls")]
    pub tls: Option<crate::transport::tls::TlsSettings>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: MAX_UDP_PACKET_SIZE,
            worker_tasks: 4,
            event_queue_capacity: 1024,
            recv_buffer_pool_capacity: 256,
            max_connections: 1024,
            max_local_addresses: 32,
            udp_drain_budget: 32,
            reopen_on_socket_error: true,
            connect_timeout: Duration::from_secs(10),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl TransportConfig {
    /// Returns a config sized down for tests: tiny pools, no worker pool.
    pub fn small() -> Self {
        Self {
            worker_tasks: 0,
            event_queue_capacity: 8,
            recv_buffer_pool_capacity: 4,
            max_connections: 8,
            max_local_addresses: 4,
            ..Self::default()
        }
    }
}

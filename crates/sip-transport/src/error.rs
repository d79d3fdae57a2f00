//! Error types for the transport engine.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Which bounded resource ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Event cells in the dispatch queue.
    EventQueue,
    /// Pooled receive buffers.
    ReceiveBuffers,
    /// Connection table capacity.
    Connections,
    /// Local address table capacity.
    LocalAddresses,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::EventQueue => "event queue",
            ResourceKind::ReceiveBuffers => "receive buffers",
            ResourceKind::Connections => "connections",
            ResourceKind::LocalAddresses => "local addresses",
        };
        f.write_str(name)
    }
}

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum Error {
    /// The handle refers to an object that no longer exists
    #[error("Invalid handle: object already destructed")]
    InvalidHandle,

    /// A bounded pool or queue was exhausted; recoverable via deferred retry
    #[error("Out of resources: {0} exhausted")]
    OutOfResources(ResourceKind),

    /// Message larger than the configured buffer; not retried
    #[error("Insufficient buffer: message of {message_len} bytes exceeds {buffer_len}")]
    InsufficientBuffer {
        message_len: usize,
        buffer_len: usize,
    },

    /// Socket-level send/receive failure
    #[error("Network problem: {0}")]
    NetworkProblem(String),

    /// Lookup miss; benign for callers that probe optimistically
    #[error("Not found")]
    NotFound,

    /// Operation invalid for the object's current state
    #[error("Illegal action: {0}")]
    IllegalAction(&'static str),

    /// Failed to bind a socket to the given address
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to connect to the given address
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, String),

    /// TLS configuration or certificate material problem
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// True only for failures the OOR machinery can retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfResources(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::NetworkProblem(err.to_string())
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let oor = Error::OutOfResources(ResourceKind::EventQueue);
        assert_eq!(oor.to_string(), "Out of resources: event queue exhausted");
        assert!(oor.is_recoverable());

        let buf = Error::InsufficientBuffer {
            message_len: 100,
            buffer_len: 50,
        };
        assert!(buf.to_string().contains("100"));
        assert!(!buf.is_recoverable());

        let io_err = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(io_err, Error::NetworkProblem(_)));
    }
}

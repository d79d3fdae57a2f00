//! Transport primitives: kinds, connection and address state, boundary traits.

pub mod connection;
pub mod local_addr;
#[cfg(all(feature = "sctp", unix))]
pub mod sctp;
#[cfg(feature = "tls")]
pub mod tls;

use std::fmt;
use std::net::SocketAddr;

pub use connection::{ConnState, Connection, SendInfo, TlsState, WeakConnection};
pub use local_addr::LocalAddress;

/// Transport protocol for a local address or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Sctp,
}

impl TransportKind {
    /// True for connection-oriented transports.
    pub fn is_stream(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Sctp => "SCTP",
        };
        f.write_str(name)
    }
}

/// Identifies one logical owner attached to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub(crate) u64);

/// Outcome reported to the owner of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// The message was fully written to the socket
    MsgSent,
    /// The message was discarded before it could be written
    MsgNotSent,
    /// The connection failed while the message was pending
    Error,
}

/// Why a connection left its connected state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Undefined,
    /// The peer closed the stream
    RemoteClosed,
    /// A socket-level read or write error
    NetworkError,
    /// The local side asked for the close
    LocalClosed,
    /// The outbound connect never completed
    ConnectFailed,
}

/// Per-message sending flags carried by a queued [`SendInfo`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// SCTP stream id the message should go out on
    pub sctp_stream: Option<u16>,
    /// Request unordered delivery where the transport supports it
    pub unordered: bool,
}

/// Callbacks a logical owner registers when attaching to a connection.
///
/// Both callbacks are invoked from worker tasks with no engine lock held,
/// and may arrive after the owner has lost interest; owners are expected to
/// validate the connection handle before acting.
pub trait ConnectionOwner: Send + Sync {
    /// The connection changed state
    fn on_connection_state(&self, conn: &Connection, state: ConnState, reason: DisconnectReason);

    /// A message queued by this owner reached a terminal outcome
    fn on_connection_status(&self, conn: &Connection, status: ConnStatus);
}

/// Upward boundary to the parsing/protocol layer.
///
/// Receives raw bytes exactly as they came off the wire, together with the
/// octet-count framing hints. Reassembly of partial stream reads belongs to
/// the implementor, not the engine.
pub trait MessageSink: Send + Sync {
    fn on_message(
        &self,
        data: &[u8],
        source: SocketAddr,
        local: &LocalAddress,
        connection: Option<&Connection>,
        hints: crate::events::FramingHints,
    );
}

/// Optional outbound pacing hook consulted before each UDP send.
pub trait SendGate: Send + Sync {
    /// Return false to suppress this transmission
    fn allow_send(&self, dest: SocketAddr, len: usize) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display_and_stream() {
        assert_eq!(TransportKind::Udp.to_string(), "UDP");
        assert_eq!(TransportKind::Tls.to_string(), "TLS");
        assert!(!TransportKind::Udp.is_stream());
        assert!(TransportKind::Tcp.is_stream());
        assert!(TransportKind::Sctp.is_stream());
    }
}

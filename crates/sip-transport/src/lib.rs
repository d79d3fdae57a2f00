//! SIP transport engine for the viaduct stack.
//!
//! This crate owns sockets and carries SIP messages across UDP, TCP, TLS
//! and SCTP: connection lifecycle, a bounded event dispatch queue between
//! socket tasks and worker tasks, out-of-resource deferred retry, and a
//! per-message transmitter state machine. Message parsing lives above the
//! [`MessageSink`] boundary; bytes pass through this crate opaquely.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod transmitter;
pub mod transport;

// Internal modules
#[cfg(test)]
mod tests;

// Re-export commonly used types and functions
pub use config::TransportConfig;
pub use error::{Error, ResourceKind, Result};
pub use events::{
    Event, FramingHints, ObjectEvent, ObjectEventHandler, ObjectEventScope, ResourceFreed,
};
pub use manager::{ResourcesStatus, TransportManager};
pub use transmitter::{
    Destination, DestinationResolver, SendFailureReason, Transmitter, TransmitterObserver, TxState,
};
pub use transport::{
    ConnState, ConnStatus, Connection, ConnectionOwner, DisconnectReason, LocalAddress,
    MessageSink, OwnerId, SendFlags, SendGate, TlsState, TransportKind, WeakConnection,
};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ConnState, ConnStatus, Connection, ConnectionOwner, Destination, DestinationResolver,
        DisconnectReason, Error, Event, FramingHints, LocalAddress, MessageSink, ObjectEvent,
        ObjectEventHandler, ResourcesStatus, Result, SendFailureReason, SendFlags, TransportConfig,
        TransportKind, Transmitter, TransmitterObserver, TxState,
    };
}

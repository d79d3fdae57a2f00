//! Typed events flowing from socket tasks to worker tasks.
//!
//! Socket tasks never run application logic; they convert readiness and
//! bytes into [`Event`] values tailed onto the bounded dispatch queue, and
//! worker tasks drain the queue and invoke the handlers.

pub mod oor;
pub mod queue;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub use oor::OorRegistry;
pub use queue::{CellPermit, EventQueue, QueuedEvent, RecvBuffer};

use crate::transport::{Connection, DisconnectReason, LocalAddress};

/// Which bounded resource was just released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceFreed {
    /// An event cell returned to the dispatch queue pool
    QueueCellFreed,
    /// A pooled receive buffer was released
    ReadBufferFreed,
}

/// Octet-count framing hints passed through to the parsing layer.
///
/// The engine fills in the total byte count; the header/body split is
/// `None` unless an upstream framer has already determined the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramingHints {
    /// Total bytes in this delivery
    pub total: usize,
    /// Length of the SIP header section, when known
    pub header: Option<usize>,
    /// Length of the body, when known
    pub body: Option<usize>,
}

impl FramingHints {
    pub fn from_total(total: usize) -> Self {
        Self {
            total,
            header: None,
            body: None,
        }
    }
}

/// Handler invoked on a worker task for a deferred object event.
pub trait ObjectEventHandler: Send + Sync {
    fn on_object_event(&self, param1: u32, param2: u32);
}

/// Whether an object event originated inside the engine or from the
/// application side of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEventScope {
    Internal,
    External,
}

/// A deferred callback directed at an arbitrary manager-owned object.
#[derive(Clone)]
pub struct ObjectEvent {
    handler: Arc<dyn ObjectEventHandler>,
    param1: u32,
    param2: u32,
    scope: ObjectEventScope,
    tag: Option<&'static str>,
}

impl ObjectEvent {
    pub fn new(handler: Arc<dyn ObjectEventHandler>, param1: u32, param2: u32) -> Self {
        Self {
            handler,
            param1,
            param2,
            scope: ObjectEventScope::External,
            tag: None,
        }
    }

    /// An event originating inside the stack's own layers rather than the
    /// application side of the API.
    pub fn internal(handler: Arc<dyn ObjectEventHandler>, param1: u32, param2: u32) -> Self {
        Self {
            handler,
            param1,
            param2,
            scope: ObjectEventScope::Internal,
            tag: None,
        }
    }

    /// Attach a log tag shown when the event is dispatched or deferred
    pub fn with_tag(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn scope(&self) -> ObjectEventScope {
        self.scope
    }

    pub fn tag(&self) -> Option<&'static str> {
        self.tag
    }

    /// Run the stored handler
    pub(crate) fn invoke(&self) {
        if let Some(tag) = self.tag {
            tracing::trace!("dispatching object event '{}'", tag);
        }
        self.handler.on_object_event(self.param1, self.param2);
    }
}

impl fmt::Debug for ObjectEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectEvent")
            .field("param1", &self.param1)
            .field("param2", &self.param2)
            .field("scope", &self.scope)
            .field("tag", &self.tag)
            .finish()
    }
}

/// One unit of work handed from a socket task to the worker pool
pub enum Event {
    /// Raw bytes arrived on a socket
    MessageReceived {
        /// Pooled buffer holding the received bytes
        data: RecvBuffer,
        /// Peer the bytes came from
        source: SocketAddr,
        /// Local address the bytes arrived on
        local: LocalAddress,
        /// Owning connection, or `None` for UDP
        connection: Option<Connection>,
        /// Octet-count framing pass-through
        hints: FramingHints,
    },
    /// An outbound connect completed
    Connected(Connection),
    /// A connection left its connected state
    Disconnected(Connection, DisconnectReason),
    /// Queued messages on a connection reached terminal outcomes
    Writable(Connection),
    /// A scheduled timer fired
    TimerExpired(ObjectEvent),
    /// A deferred callback directed at a manager-owned object
    Object(ObjectEvent),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::MessageReceived { source, hints, .. } => f
                .debug_struct("MessageReceived")
                .field("source", source)
                .field("total", &hints.total)
                .finish(),
            Event::Connected(conn) => write!(f, "Connected({:?})", conn),
            Event::Disconnected(conn, reason) => {
                write!(f, "Disconnected({:?}, {:?})", conn, reason)
            }
            Event::Writable(conn) => write!(f, "Writable({:?})", conn),
            Event::TimerExpired(ev) => write!(f, "TimerExpired({:?})", ev),
            Event::Object(ev) => write!(f, "Object({:?})", ev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder(AtomicU32, AtomicU32);

    impl ObjectEventHandler for Recorder {
        fn on_object_event(&self, param1: u32, param2: u32) {
            self.0.store(param1, Ordering::SeqCst);
            self.1.store(param2, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_object_event_invoke() {
        let recorder = Arc::new(Recorder(AtomicU32::new(0), AtomicU32::new(0)));
        let ev = ObjectEvent::new(recorder.clone(), 7, 9).with_tag("test");
        assert_eq!(ev.scope(), ObjectEventScope::External);
        ev.invoke();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 7);
        assert_eq!(recorder.1.load(Ordering::SeqCst), 9);
    }
}

//! Out-of-resource recovery.
//!
//! Operations that fail because the event-cell or receive-buffer pool ran
//! dry are never dropped; they are parked here and replayed when capacity
//! comes back. Replay goes through exactly the same tail paths a live
//! socket notification would take.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{ObjectEvent, ResourceFreed};
use crate::manager::ManagerShared;
use crate::transport::connection::WeakConnection;

/// Pending select-event bits a connection can be waiting to retry.
pub(crate) const EV_CLOSE: u8 = 0b0001;
pub(crate) const EV_CONNECT: u8 = 0b0010;
pub(crate) const EV_WRITE: u8 = 0b0100;
pub(crate) const EV_READ: u8 = 0b1000;

fn bit_name(bit: u8) -> &'static str {
    match bit {
        EV_CLOSE => "close",
        EV_CONNECT => "connect",
        EV_WRITE => "write",
        EV_READ => "read",
        _ => "?",
    }
}

struct OorInner {
    /// Manager-level object events that failed to enqueue
    object_events: VecDeque<ObjectEvent>,
    /// Connections with at least one pending retry bit
    connections: Vec<WeakConnection>,
}

/// Registry of work deferred by pool/queue exhaustion.
pub struct OorRegistry {
    inner: Mutex<OorInner>,
    /// Serializes replay passes; a notification arriving while a pass is
    /// running is absorbed by that pass.
    pass: Mutex<()>,
}

impl OorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(OorInner {
                object_events: VecDeque::new(),
                connections: Vec::new(),
            }),
            pass: Mutex::new(()),
        })
    }

    /// Park an object event that could not be enqueued.
    pub(crate) fn defer_object_event(&self, event: ObjectEvent) {
        if let Some(tag) = event.tag() {
            debug!("deferring object event '{}' until resources free", tag);
        }
        self.inner.lock().object_events.push_back(event);
    }

    /// Mark retry bits on a connection and make sure it is tracked.
    ///
    /// The per-connection `tracked` flag keeps a connection from appearing
    /// in the list twice.
    pub(crate) fn track_connection(&self, conn: &crate::transport::Connection, bits: u8) {
        conn.add_oor_bits(bits);
        if !conn.test_and_set_oor_tracked() {
            trace!(
                "connection {} tracked for OOR retry ({})",
                conn.id(),
                bit_name(bits)
            );
            self.inner.lock().connections.push(conn.downgrade());
        }
    }

    pub(crate) fn deferred_object_events(&self) -> usize {
        self.inner.lock().object_events.len()
    }

    pub(crate) fn tracked_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Replay deferred work now that a resource was released.
    ///
    /// Idempotent per pass: once a bit has been retried for a connection it
    /// is not retried again within the same pass, even if the retry parked
    /// it right back.
    pub(crate) fn on_resource_available(&self, reason: ResourceFreed, shared: &Arc<ManagerShared>) {
        // A pass is already draining; it will pick up anything we would.
        let Some(_pass) = self.pass.try_lock() else {
            return;
        };

        if reason == ResourceFreed::QueueCellFreed {
            self.replay_object_events(shared);
        }

        // Take the list out so the registry lock is never held across a
        // replay (replays may re-enter track_connection).
        let parked = std::mem::take(&mut self.inner.lock().connections);
        let mut keep = Vec::new();

        let retryable = match reason {
            ResourceFreed::QueueCellFreed => EV_CLOSE | EV_CONNECT | EV_WRITE | EV_READ,
            ResourceFreed::ReadBufferFreed => EV_READ,
        };

        for weak in parked {
            let Ok(conn) = weak.upgrade() else {
                continue;
            };
            if conn.is_terminal() {
                conn.clear_oor_tracked();
                continue;
            }

            let mut retried: u8 = 0;
            loop {
                let pending = conn.take_oor_bits(retryable & !retried);
                if pending == 0 {
                    break;
                }
                retried |= pending;
                for bit in [EV_CLOSE, EV_CONNECT, EV_WRITE, EV_READ] {
                    if pending & bit != 0 {
                        trace!("replaying {} event for connection {}", bit_name(bit), conn.id());
                        conn.replay_oor(bit);
                    }
                }
            }

            if conn.oor_bits() != 0 {
                // A retry parked it again (or a bit outside this reason's
                // retryable set is still pending); keep tracking.
                keep.push(weak);
            } else {
                conn.clear_oor_tracked();
                // A racing tail may have added bits between the check and
                // the clear; re-track if so.
                if conn.oor_bits() != 0 && !conn.test_and_set_oor_tracked() {
                    keep.push(weak);
                }
            }
        }

        if !keep.is_empty() {
            self.inner.lock().connections.extend(keep);
        }
    }

    /// Re-attempt deferred object events, front to back. The first one
    /// that fails to enqueue stays in place, and the pass moves on.
    fn replay_object_events(&self, shared: &Arc<ManagerShared>) {
        loop {
            let Some(event) = self.inner.lock().object_events.pop_front() else {
                return;
            };
            if let Err(e) = shared.try_enqueue_object_event(event.clone()) {
                warn!("object event replay still failing: {}", e);
                self.inner.lock().object_events.push_front(event);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_names() {
        assert_eq!(bit_name(EV_CLOSE), "close");
        assert_eq!(bit_name(EV_READ), "read");
    }
}

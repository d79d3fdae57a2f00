//! Per-outbound-message transmitter state machine.
//!
//! A [`Transmitter`] carries one outbound message from destination
//! resolution to a terminal outcome. It attaches itself as an owner of the
//! connection it sends on, so connection status callbacks drive its state
//! asynchronously; every callback validates that it still refers to the
//! connection this transmitter believes it owns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::manager::ManagerShared;
use crate::transport::{
    ConnState, ConnStatus, Connection, ConnectionOwner, DisconnectReason, LocalAddress, OwnerId,
    SendFlags, TransportKind,
};

/// Transmitter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Created; nothing sent yet
    Idle,
    /// Destination discovery in progress
    ResolvingDestination,
    /// Addressing fixed; the owner may still mutate the message
    ReadyForSending,
    /// Handed to the transport
    FinalDestinationResolved,
    /// Fully transmitted
    MessageSent,
    /// Terminal failure, reported once
    MessageSendFailure,
    /// Torn down by its owner
    Terminated,
}

/// Reason reported with `MessageSendFailure`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureReason {
    Undefined,
    NetworkProblem,
    ConnectionError,
    OutOfResources,
}

/// One resolved destination for an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub kind: TransportKind,
    pub addr: SocketAddr,
    /// Application-supplied connection alias, when reuse should be keyed
    /// by alias rather than by route
    pub alias: Option<String>,
}

impl Destination {
    pub fn new(kind: TransportKind, addr: SocketAddr) -> Self {
        Self {
            kind,
            addr,
            alias: None,
        }
    }
}

/// External destination discovery (DNS and friends live behind this).
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, target: &str) -> Result<Vec<Destination>>;
}

/// Owner-side callbacks of a transmitter.
pub trait TransmitterObserver: Send + Sync {
    /// Observation point just before transmission: the outbound message
    /// may still be mutated against the chosen local address, and the
    /// transmitter may be terminated.
    fn on_ready_for_sending(&self, tx: &Transmitter, local: &LocalAddress, message: &mut BytesMut);

    /// Terminal outcome, reported exactly once per sending attempt
    fn on_completed(&self, tx: &Transmitter, state: TxState, reason: SendFailureReason);
}

pub(crate) struct TxInner {
    weak_self: Weak<TxInner>,
    manager: Weak<ManagerShared>,
    resolver: Arc<dyn DestinationResolver>,
    observer: Arc<dyn TransmitterObserver>,
    state: Mutex<TxState>,
    dest: Mutex<Option<Destination>>,
    candidates: Mutex<Vec<Destination>>,
    local: Mutex<Option<LocalAddress>>,
    conn: Mutex<Option<(Connection, OwnerId)>>,
    message: Mutex<BytesMut>,
    completed: AtomicBool,
}

/// Handle to one outbound-message controller
#[derive(Clone)]
pub struct Transmitter {
    inner: Arc<TxInner>,
}

impl Transmitter {
    pub(crate) fn new(
        shared: &Arc<ManagerShared>,
        resolver: Arc<dyn DestinationResolver>,
        observer: Arc<dyn TransmitterObserver>,
    ) -> Transmitter {
        let inner = Arc::new_cyclic(|weak| TxInner {
            weak_self: weak.clone(),
            manager: Arc::downgrade(shared),
            resolver,
            observer,
            state: Mutex::new(TxState::Idle),
            dest: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            conn: Mutex::new(None),
            message: Mutex::new(BytesMut::new()),
            completed: AtomicBool::new(false),
        });
        Transmitter { inner }
    }

    pub fn state(&self) -> TxState {
        *self.inner.state.lock()
    }

    pub fn destination(&self) -> Option<Destination> {
        self.inner.dest.lock().clone()
    }

    /// Local address selected for the current destination
    pub fn local(&self) -> Option<LocalAddress> {
        self.inner.local.lock().clone()
    }

    /// Set the destination directly, skipping resolution.
    pub fn set_destination(&self, dest: Destination) {
        *self.inner.dest.lock() = Some(dest);
    }

    /// Replace the outbound message.
    pub fn set_message(&self, data: &[u8]) {
        let mut message = self.inner.message.lock();
        message.clear();
        message.extend_from_slice(data);
    }

    /// Move to the next resolved destination candidate, for owner-driven
    /// failover after a `MessageSendFailure`.
    pub fn advance_destination(&self) -> Option<Destination> {
        let mut candidates = self.inner.candidates.lock();
        if candidates.len() <= 1 {
            return None;
        }
        candidates.remove(0);
        let next = candidates[0].clone();
        *self.inner.dest.lock() = Some(next.clone());
        Some(next)
    }

    /// Re-arm a completed transmitter for another sending attempt.
    pub fn reset_for_retry(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state == TxState::Terminated {
            return Err(Error::IllegalAction("retry on a terminated transmitter"));
        }
        *state = TxState::Idle;
        self.inner.completed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Kick destination discovery and carry the message to the wire.
    pub async fn start_sending(&self, target: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == TxState::Terminated {
                return Err(Error::InvalidHandle);
            }
            *state = TxState::ResolvingDestination;
        }
        let candidates = match self.inner.resolver.resolve(target).await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                debug!("no destinations resolved for '{}'", target);
                self.complete(TxState::MessageSendFailure, SendFailureReason::Undefined);
                return Ok(());
            }
            Err(e) => {
                warn!("destination resolution for '{}' failed: {}", target, e);
                self.complete(
                    TxState::MessageSendFailure,
                    SendFailureReason::NetworkProblem,
                );
                return Ok(());
            }
        };
        *self.inner.dest.lock() = Some(candidates[0].clone());
        *self.inner.candidates.lock() = candidates;
        self.continue_sending().await
    }

    /// Send with an already-known destination.
    pub async fn send(&self) -> Result<()> {
        self.continue_sending().await
    }

    /// Set the message and send in one call.
    pub async fn send_buffer(&self, data: &[u8]) -> Result<()> {
        self.set_message(data);
        self.continue_sending().await
    }

    /// Re-entry point after resolution (and after owner callbacks).
    ///
    /// Transmission failures are reported through the observer, once; the
    /// returned `Err` is reserved for misuse (no destination, dead
    /// manager). A transmitter torn down by its owner mid-flight is a
    /// clean no-op.
    pub async fn continue_sending(&self) -> Result<()> {
        if self.state() == TxState::Terminated {
            return Ok(());
        }
        let dest = self
            .inner
            .dest
            .lock()
            .clone()
            .ok_or(Error::IllegalAction("no destination resolved"))?;
        let shared = self.inner.manager.upgrade().ok_or(Error::InvalidHandle)?;

        // Re-resolve the local address; the destination may have changed
        // since the last attempt.
        let local = match shared.local_for_destination(dest.kind, dest.addr) {
            Ok(local) => local,
            Err(_) => {
                warn!("no local address for {} towards {}", dest.kind, dest.addr);
                self.complete(TxState::MessageSendFailure, SendFailureReason::Undefined);
                return Ok(());
            }
        };
        *self.inner.local.lock() = Some(local.clone());

        {
            let mut state = self.inner.state.lock();
            if *state == TxState::Terminated {
                return Ok(());
            }
            *state = TxState::ReadyForSending;
        }

        // Observation point: the owner fixes up address-dependent fields
        // against the chosen local address, or tears the transmitter down.
        {
            let mut message = std::mem::take(&mut *self.inner.message.lock());
            self.inner
                .observer
                .on_ready_for_sending(self, &local, &mut message);
            *self.inner.message.lock() = message;
        }
        if self.state() == TxState::Terminated {
            debug!("transmitter terminated during ready-for-sending; aborting cleanly");
            return Ok(());
        }

        *self.inner.state.lock() = TxState::FinalDestinationResolved;
        let data: Bytes = self.inner.message.lock().clone().freeze();

        match dest.kind {
            TransportKind::Udp => match local.send_message(&data, dest.addr).await {
                Ok(_) => {
                    self.complete(TxState::MessageSent, SendFailureReason::Undefined);
                    Ok(())
                }
                Err(e) => self.transmission_failed(e),
            },
            _ => {
                let conn = match shared.usable_or_construct(dest.kind, &local, dest.addr) {
                    Ok(conn) => conn,
                    Err(e) => return self.transmission_failed(e),
                };
                let owner = match conn.attach_owner(self.inner.clone()) {
                    Ok(owner) => owner,
                    Err(e) => return self.transmission_failed(e),
                };
                *self.inner.conn.lock() = Some((conn.clone(), owner));
                if let Some(alias) = &dest.alias {
                    shared.register_alias(alias, &conn);
                }
                match conn.send(data, SendFlags::default(), owner) {
                    // The terminal outcome arrives via status callbacks.
                    Ok(()) => Ok(()),
                    Err(e) => {
                        let _ = conn.detach_owner(owner);
                        *self.inner.conn.lock() = None;
                        self.transmission_failed(e)
                    }
                }
            }
        }
    }

    /// Tear the transmitter down; late callbacks become no-ops.
    pub fn terminate(&self) {
        *self.inner.state.lock() = TxState::Terminated;
        let conn = self.inner.conn.lock().take();
        if let Some((conn, owner)) = conn {
            let _ = conn.detach_owner(owner);
        }
        trace!("transmitter terminated");
    }

    /// Does this transmitter currently own `conn`? Used to discard stale
    /// connection callbacks.
    fn owns_connection(&self, conn: &Connection) -> bool {
        self.inner
            .conn
            .lock()
            .as_ref()
            .map_or(false, |(own, _)| Arc::ptr_eq(&own.inner, &conn.inner))
    }

    fn transmission_failed(&self, err: Error) -> Result<()> {
        match err {
            // The object is already gone; there is no one left to notify.
            Error::InvalidHandle => {
                debug!("transmission failed on a destructed object; ignored");
                Ok(())
            }
            Error::OutOfResources(kind) => {
                warn!("transmission deferred failure: {} exhausted", kind);
                self.complete(
                    TxState::MessageSendFailure,
                    SendFailureReason::OutOfResources,
                );
                Ok(())
            }
            Error::NetworkProblem(_) | Error::BindFailed(..) | Error::ConnectFailed(..) => {
                self.complete(
                    TxState::MessageSendFailure,
                    SendFailureReason::NetworkProblem,
                );
                Ok(())
            }
            _ => {
                self.complete(TxState::MessageSendFailure, SendFailureReason::Undefined);
                Ok(())
            }
        }
    }

    fn complete(&self, state: TxState, reason: SendFailureReason) {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut current = self.inner.state.lock();
            if *current != TxState::Terminated {
                *current = state;
            }
        }
        trace!("transmitter completed: {:?} ({:?})", state, reason);
        self.inner.observer.on_completed(self, state, reason);
    }
}

impl TxInner {
    fn handle(&self) -> Option<Transmitter> {
        self.weak_self.upgrade().map(|inner| Transmitter { inner })
    }
}

impl ConnectionOwner for TxInner {
    fn on_connection_state(&self, conn: &Connection, state: ConnState, _reason: DisconnectReason) {
        let Some(tx) = self.handle() else { return };
        if !tx.owns_connection(conn) {
            return;
        }
        if matches!(
            state,
            ConnState::Closing | ConnState::Closed | ConnState::Terminated
        ) {
            tx.complete(
                TxState::MessageSendFailure,
                SendFailureReason::ConnectionError,
            );
        }
    }

    fn on_connection_status(&self, conn: &Connection, status: ConnStatus) {
        let Some(tx) = self.handle() else { return };
        if !tx.owns_connection(conn) {
            return;
        }
        match status {
            ConnStatus::MsgSent => tx.complete(TxState::MessageSent, SendFailureReason::Undefined),
            ConnStatus::MsgNotSent => {
                tx.complete(TxState::MessageSendFailure, SendFailureReason::Undefined)
            }
            ConnStatus::Error => tx.complete(
                TxState::MessageSendFailure,
                SendFailureReason::ConnectionError,
            ),
        }
    }
}

impl fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transmitter({:?}, dest: {:?})",
            self.state(),
            self.destination()
        )
    }
}

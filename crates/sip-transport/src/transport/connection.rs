//! Stream connection lifecycle: TCP, TLS and SCTP sessions.
//!
//! A [`Connection`] is a cheap-clone handle over shared state. Socket pumps
//! (one reader task, one writer task) convert I/O into queue events; all
//! state-machine consequences and owner callbacks run on worker tasks.
//! Owner callbacks are always invoked with no engine lock held.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::oor::{EV_CLOSE, EV_CONNECT, EV_READ, EV_WRITE};
use crate::events::{Event, FramingHints};
use crate::manager::ManagerShared;

use super::{
    ConnStatus, ConnectionOwner, DisconnectReason, LocalAddress, OwnerId, SendFlags, TransportKind,
};

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Main connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Freshly allocated, not yet usable
    Idle,
    /// Constructed and ready to open on first send
    Ready,
    /// Outbound connect in progress
    Connecting,
    /// TCP (or TLS-over-TCP) session established
    TcpConnected,
    /// SCTP association established
    SctpConnected,
    /// Teardown started; draining queued writes
    Closing,
    /// Socket closed; owners may still be attached
    Closed,
    /// Fully torn down and unindexed
    Terminated,
}

/// TLS sub-state, meaningful only for TLS connections.
///
/// Gates usability the same way the main state does; a failed handshake
/// lands the main state in `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Undefined,
    HandshakeStarted,
    HandshakeReady,
    HandshakeCompleted,
    Connected,
}

/// One queued outbound message on a connection
pub struct SendInfo {
    pub buffer: Bytes,
    pub len: usize,
    /// Write offset for partial, non-blocking writes
    pub curr_pos: usize,
    pub flags: SendFlags,
    pub owner: OwnerId,
    pub(crate) seq: u64,
    pub(crate) not_sent_reported: bool,
    /// Survives owner-detach cleanup passes
    pub(crate) keep_on_cleanup: bool,
}

#[derive(Clone)]
struct OwnerSlot {
    id: OwnerId,
    callbacks: Arc<dyn ConnectionOwner>,
}

enum SendAction {
    Connect,
    Wake,
    Defer,
}

pub(crate) struct ConnInner {
    id: u64,
    kind: TransportKind,
    local: LocalAddress,
    peer: SocketAddr,
    manager: Weak<ManagerShared>,
    state: Mutex<ConnState>,
    tls_state: Mutex<TlsState>,
    send_queue: Mutex<VecDeque<SendInfo>>,
    /// Terminal outcomes awaiting delivery through a Writable event
    outcomes: Mutex<Vec<(OwnerId, ConnStatus)>>,
    owners: Mutex<Vec<OwnerSlot>>,
    usage: AtomicI64,
    next_owner: AtomicU64,
    next_seq: AtomicU64,
    /// A Disconnected event is already in the queue
    close_event_queued: AtomicBool,
    /// Writable events tailed but not yet processed; a Disconnected event
    /// is requeued behind them
    pending_writable: AtomicUsize,
    oor_bits: AtomicU8,
    oor_tracked: AtomicBool,
    disconnect_reason: Mutex<DisconnectReason>,
    writer_wake: Notify,
    read_resume: Notify,
    writer_io: AsyncMutex<Option<BoxWriter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    alias: Mutex<Option<String>>,
}

/// Handle to one stream connection
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

/// Non-owning connection handle; upgrading answers "is this still valid"
pub struct WeakConnection {
    inner: Weak<ConnInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Result<Connection> {
        self.inner
            .upgrade()
            .map(|inner| Connection { inner })
            .ok_or(Error::InvalidHandle)
    }
}

impl Connection {
    fn new_inner(
        shared: &Arc<ManagerShared>,
        kind: TransportKind,
        local: LocalAddress,
        peer: SocketAddr,
        state: ConnState,
    ) -> Connection {
        Connection {
            inner: Arc::new(ConnInner {
                id: shared.next_connection_id(),
                kind,
                local,
                peer,
                manager: Arc::downgrade(shared),
                state: Mutex::new(state),
                tls_state: Mutex::new(TlsState::Undefined),
                send_queue: Mutex::new(VecDeque::new()),
                outcomes: Mutex::new(Vec::new()),
                owners: Mutex::new(Vec::new()),
                usage: AtomicI64::new(0),
                next_owner: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
                close_event_queued: AtomicBool::new(false),
                pending_writable: AtomicUsize::new(0),
                oor_bits: AtomicU8::new(0),
                oor_tracked: AtomicBool::new(false),
                disconnect_reason: Mutex::new(DisconnectReason::Undefined),
                writer_wake: Notify::new(),
                read_resume: Notify::new(),
                writer_io: AsyncMutex::new(None),
                tasks: Mutex::new(Vec::new()),
                alias: Mutex::new(None),
            }),
        }
    }

    /// Construct an outbound connection in the `Ready` state.
    pub(crate) fn construct(
        shared: &Arc<ManagerShared>,
        kind: TransportKind,
        local: LocalAddress,
        peer: SocketAddr,
    ) -> Result<Connection> {
        if kind == TransportKind::Udp {
            return Err(Error::IllegalAction("UDP has no connections"));
        }
        let conn = Self::new_inner(shared, kind, local, peer, ConnState::Ready);
        shared.register_connection(&conn)?;
        debug!("constructed {} connection {} to {}", kind, conn.id(), peer);
        Ok(conn)
    }

    /// Adopt an inbound stream accepted by a listener: the connection is
    /// born connected, its pumps start immediately and a Connected event
    /// is tailed.
    pub(crate) async fn adopt(
        shared: &Arc<ManagerShared>,
        kind: TransportKind,
        local: LocalAddress,
        peer: SocketAddr,
        reader: BoxReader,
        writer: BoxWriter,
        tls_established: bool,
    ) -> Result<Connection> {
        let state = if kind == TransportKind::Sctp {
            ConnState::SctpConnected
        } else {
            ConnState::TcpConnected
        };
        let conn = Self::new_inner(shared, kind, local, peer, state);
        if tls_established {
            conn.set_tls_state(TlsState::HandshakeCompleted);
        }
        shared.register_connection(&conn)?;
        *conn.inner.writer_io.lock().await = Some(writer);
        conn.spawn_reader(reader, shared.clone());
        conn.spawn_writer(shared.clone());
        info!("accepted {} connection {} from {}", kind, conn.id(), peer);
        conn.try_tail_connect();
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn local(&self) -> LocalAddress {
        self.inner.local.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local.bound_addr()
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock()
    }

    pub fn tls_state(&self) -> TlsState {
        *self.inner.tls_state.lock()
    }

    pub fn alias(&self) -> Option<String> {
        self.inner.alias.lock().clone()
    }

    pub(crate) fn set_alias_value(&self, alias: &str) {
        *self.inner.alias.lock() = Some(alias.to_string());
    }

    pub fn usage(&self) -> i64 {
        self.inner.usage.load(Ordering::SeqCst)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn shared(&self) -> Option<Arc<ManagerShared>> {
        self.inner.manager.upgrade()
    }

    fn set_state(&self, state: ConnState) {
        *self.inner.state.lock() = state;
    }

    pub(crate) fn set_tls_state(&self, state: TlsState) {
        trace!("connection {} TLS state -> {:?}", self.id(), state);
        *self.inner.tls_state.lock() = state;
    }

    fn set_disconnect_reason(&self, reason: DisconnectReason) {
        *self.inner.disconnect_reason.lock() = reason;
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state(), ConnState::Closed | ConnState::Terminated)
    }

    pub(crate) fn pending_writable(&self) -> usize {
        self.inner.pending_writable.load(Ordering::SeqCst)
    }

    pub(crate) fn close_event_queued(&self) -> bool {
        self.inner.close_event_queued.load(Ordering::SeqCst)
    }

    /// Attach a logical owner. Forbidden once the connection has begun
    /// closing.
    pub fn attach_owner(&self, callbacks: Arc<dyn ConnectionOwner>) -> Result<OwnerId> {
        let state = self.state();
        if matches!(
            state,
            ConnState::Closing | ConnState::Closed | ConnState::Terminated
        ) {
            return Err(Error::IllegalAction("attach on a closing connection"));
        }
        let id = OwnerId(self.inner.next_owner.fetch_add(1, Ordering::SeqCst));
        self.inner.owners.lock().push(OwnerSlot { id, callbacks });
        self.inner.usage.fetch_add(1, Ordering::SeqCst);
        trace!("owner {:?} attached to connection {}", id, self.id());
        Ok(id)
    }

    /// Detach a logical owner; when the last owner leaves, the close
    /// machinery runs.
    pub fn detach_owner(&self, id: OwnerId) -> Result<()> {
        let removed = {
            let mut owners = self.inner.owners.lock();
            let before = owners.len();
            owners.retain(|slot| slot.id != id);
            before != owners.len()
        };
        if !removed {
            return Err(Error::NotFound);
        }
        // Unsent messages leave with their owner, except a message flagged
        // to stay or one already partially on the wire.
        {
            let mut queue = self.inner.send_queue.lock();
            queue.retain(|si| si.owner != id || si.keep_on_cleanup || si.curr_pos > 0);
        }
        let usage = self.inner.usage.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(usage >= 0, "usage counter went negative");
        trace!(
            "owner {:?} detached from connection {} (usage {})",
            id,
            self.id(),
            usage
        );
        if usage == 0 {
            if self.is_terminal() {
                // The socket is already down; the last owner leaving means
                // the record can go too.
                if let Some(shared) = self.shared() {
                    self.terminate(&shared);
                }
            } else {
                self.close();
            }
        }
        Ok(())
    }

    /// Can a new transmitter reuse this connection for the given route?
    ///
    /// For TLS, a handshake failure lands the main state in `Closing`, so
    /// every reachable sub-state here is an alive one (including
    /// `Undefined` before negotiation starts while TCP is healthy).
    pub fn is_usable(
        &self,
        kind: TransportKind,
        local: SocketAddr,
        peer: SocketAddr,
        alias_only: bool,
    ) -> bool {
        if self.inner.kind != kind {
            return false;
        }
        if !alias_only && (self.local_addr() != local || self.inner.peer != peer) {
            return false;
        }
        if self.close_event_queued() {
            return false;
        }
        matches!(
            self.state(),
            ConnState::Ready
                | ConnState::Connecting
                | ConnState::TcpConnected
                | ConnState::SctpConnected
        )
    }

    /// Queue a message for transmission.
    ///
    /// A `Ready` connection is opened and connected; a connection that is
    /// still connecting (or draining a close) accepts the message for
    /// deferred delivery. Synchronous failures mean the message was not
    /// queued.
    pub fn send(&self, buffer: Bytes, flags: SendFlags, owner: OwnerId) -> Result<()> {
        self.send_with(buffer, flags, owner, false)
    }

    pub(crate) fn send_with(
        &self,
        buffer: Bytes,
        flags: SendFlags,
        owner: OwnerId,
        keep_on_cleanup: bool,
    ) -> Result<()> {
        let len = buffer.len();
        let action = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnState::Closed | ConnState::Terminated => {
                    return Err(Error::IllegalAction("send on a closed connection"))
                }
                ConnState::Idle | ConnState::Ready => {
                    self.push_send_info(buffer, len, flags, owner, keep_on_cleanup);
                    *state = ConnState::Connecting;
                    SendAction::Connect
                }
                ConnState::Connecting | ConnState::Closing => {
                    self.push_send_info(buffer, len, flags, owner, keep_on_cleanup);
                    SendAction::Defer
                }
                ConnState::TcpConnected | ConnState::SctpConnected => {
                    self.push_send_info(buffer, len, flags, owner, keep_on_cleanup);
                    SendAction::Wake
                }
            }
        };
        match action {
            SendAction::Connect => self.spawn_connect()?,
            SendAction::Wake => self.inner.writer_wake.notify_one(),
            SendAction::Defer => {}
        }
        Ok(())
    }

    fn push_send_info(
        &self,
        buffer: Bytes,
        len: usize,
        flags: SendFlags,
        owner: OwnerId,
        keep_on_cleanup: bool,
    ) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.send_queue.lock().push_back(SendInfo {
            buffer,
            len,
            curr_pos: 0,
            flags,
            owner,
            seq,
            not_sent_reported: false,
            keep_on_cleanup,
        });
    }

    /// Begin application-driven teardown.
    pub fn close(&self) {
        enum CloseAction {
            None,
            DrainWriter,
            Immediate,
        }
        let action = {
            let mut state = self.inner.state.lock();
            match *state {
                ConnState::Closing | ConnState::Closed | ConnState::Terminated => {
                    CloseAction::None
                }
                ConnState::TcpConnected | ConnState::SctpConnected => {
                    *state = ConnState::Closing;
                    CloseAction::DrainWriter
                }
                ConnState::Idle | ConnState::Ready | ConnState::Connecting => {
                    *state = ConnState::Closing;
                    CloseAction::Immediate
                }
            }
        };
        match action {
            CloseAction::DrainWriter => {
                // The writer drains the queue, shuts the stream down, and
                // tails the Disconnected event.
                self.inner.writer_wake.notify_one();
            }
            CloseAction::Immediate => {
                self.set_disconnect_reason(DisconnectReason::LocalClosed);
                self.fail_queued_sends(ConnStatus::MsgNotSent);
                self.tail_disconnected_or_defer();
            }
            CloseAction::None => {}
        }
    }

    // ---- connect path -----------------------------------------------------

    fn spawn_connect(&self) -> Result<()> {
        let Some(shared) = self.shared() else {
            self.set_state(ConnState::Closed);
            return Err(Error::InvalidHandle);
        };
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            conn.run_connect(shared).await;
        });
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    async fn run_connect(&self, shared: Arc<ManagerShared>) {
        let timeout = shared.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.do_connect(&shared)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectFailed(
                self.inner.peer,
                "connect timed out".to_string(),
            )),
        };
        match result {
            Ok((reader, writer, connected_state)) => {
                // The application may have torn the connection down while
                // the connect was in flight.
                let proceed = {
                    let mut state = self.inner.state.lock();
                    if *state == ConnState::Connecting {
                        *state = connected_state;
                        true
                    } else {
                        false
                    }
                };
                if !proceed {
                    debug!(
                        "connection {} no longer connecting; discarding established stream",
                        self.id()
                    );
                    self.set_disconnect_reason(DisconnectReason::LocalClosed);
                    self.tail_disconnected_or_defer();
                    return;
                }
                *self.inner.writer_io.lock().await = Some(writer);
                self.spawn_reader(reader, shared.clone());
                self.spawn_writer(shared);
                info!(
                    "{} connection {} established to {}",
                    self.inner.kind,
                    self.id(),
                    self.inner.peer
                );
                self.try_tail_connect();
                self.inner.writer_wake.notify_one();
            }
            Err(e) => {
                warn!(
                    "{} connect {} -> {} failed: {}",
                    self.inner.kind,
                    self.id(),
                    self.inner.peer,
                    e
                );
                self.connect_failed();
            }
        }
    }

    async fn do_connect(
        &self,
        shared: &Arc<ManagerShared>,
    ) -> Result<(BoxReader, BoxWriter, ConnState)> {
        match self.inner.kind {
            TransportKind::Udp => Err(Error::IllegalAction("UDP has no connections")),
            TransportKind::Tcp => {
                let stream = TcpStream::connect(self.inner.peer)
                    .await
                    .map_err(|e| Error::ConnectFailed(self.inner.peer, e.to_string()))?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), ConnState::TcpConnected))
            }
            #[cfg(feature = "tls")]
            TransportKind::Tls => {
                let settings = shared
                    .config
                    .tls
                    .clone()
                    .ok_or(Error::IllegalAction("TLS not configured"))?;
                let connector = settings.connector()?;
                let stream = TcpStream::connect(self.inner.peer)
                    .await
                    .map_err(|e| Error::ConnectFailed(self.inner.peer, e.to_string()))?;
                self.set_tls_state(TlsState::HandshakeStarted);
                let name = settings.server_name_for(self.inner.peer)?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::ConnectFailed(self.inner.peer, e.to_string()))?;
                self.set_tls_state(TlsState::HandshakeReady);
                let (r, w) = tokio::io::split(tls);
                self.set_tls_state(TlsState::HandshakeCompleted);
                Ok((Box::new(r), Box::new(w), ConnState::TcpConnected))
            }
            #[cfg(not(feature = "tls"))]
            TransportKind::Tls => Err(Error::IllegalAction("TLS support not compiled in")),
            #[cfg(all(feature = "sctp", unix))]
            TransportKind::Sctp => {
                let _ = shared;
                let stream = super::sctp::connect(self.inner.peer).await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), ConnState::SctpConnected))
            }
            #[cfg(not(all(feature = "sctp", unix)))]
            TransportKind::Sctp => Err(Error::IllegalAction("SCTP support not compiled in")),
        }
    }

    fn connect_failed(&self) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, ConnState::Closed | ConnState::Terminated) {
                *state = ConnState::Closing;
            }
        }
        self.fail_queued_sends(ConnStatus::MsgNotSent);
        self.set_disconnect_reason(DisconnectReason::ConnectFailed);
        self.tail_disconnected_or_defer();
    }

    /// Report every queued message that has not reported a "not sent" yet,
    /// through a Writable event tailed ahead of any Disconnected event.
    /// The records stay queued (and flagged) until the connection is
    /// destructed.
    fn fail_queued_sends(&self, status: ConnStatus) {
        let reported = {
            let mut queue = self.inner.send_queue.lock();
            let mut outcomes = self.inner.outcomes.lock();
            let mut reported = false;
            for si in queue.iter_mut() {
                if !si.not_sent_reported {
                    si.not_sent_reported = true;
                    outcomes.push((si.owner, status));
                    reported = true;
                }
            }
            reported
        };
        if reported {
            self.try_tail_writable();
        }
    }

    // ---- socket pumps -----------------------------------------------------

    fn spawn_reader(&self, reader: BoxReader, shared: Arc<ManagerShared>) {
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            conn.run_reader(reader, shared).await;
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_writer(&self, shared: Arc<ManagerShared>) {
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            conn.run_writer(shared).await;
        });
        self.inner.tasks.lock().push(handle);
    }

    async fn run_reader(&self, mut reader: BoxReader, shared: Arc<ManagerShared>) {
        let mut scratch = vec![0u8; shared.config.max_buffer_size];
        loop {
            let n = match reader.read(&mut scratch).await {
                Ok(0) => {
                    debug!("connection {} closed by peer", self.id());
                    self.set_disconnect_reason(DisconnectReason::RemoteClosed);
                    self.tail_disconnected_or_defer();
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    if self.is_terminal() {
                        return;
                    }
                    warn!("read on connection {} failed: {}", self.id(), e);
                    self.set_disconnect_reason(DisconnectReason::NetworkError);
                    self.tail_disconnected_or_defer();
                    return;
                }
            };
            trace!("connection {} received {} bytes", self.id(), n);

            // Deliver the chunk; pool exhaustion parks the reader until the
            // OOR machinery signals capacity, the bytes stay in `scratch`.
            loop {
                match reserve_event_pair(&shared) {
                    Ok((cell, mut buf)) => {
                        buf.as_mut_slice()[..n].copy_from_slice(&scratch[..n]);
                        buf.set_len(n);
                        let event = Event::MessageReceived {
                            data: buf,
                            source: self.inner.peer,
                            local: self.inner.local.clone(),
                            connection: Some(self.clone()),
                            hints: FramingHints::from_total(n),
                        };
                        let _ = shared.queue.tail(event, cell);
                        break;
                    }
                    Err(_) => {
                        shared.oor.track_connection(self, EV_READ);
                        self.inner.read_resume.notified().await;
                        if self.is_terminal() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn run_writer(&self, shared: Arc<ManagerShared>) {
        loop {
            let state = self.state();
            match state {
                ConnState::TcpConnected | ConnState::SctpConnected | ConnState::Closing => {}
                _ => return,
            }

            let front = {
                let queue = self.inner.send_queue.lock();
                queue.front().map(|si| (si.buffer.clone(), si.curr_pos, si.seq))
            };
            let Some((buffer, pos, seq)) = front else {
                if state == ConnState::Closing {
                    // Queue drained after a local close: finish the write
                    // side and tear down.
                    let mut io = self.inner.writer_io.lock().await;
                    if let Some(w) = io.as_mut() {
                        let _ = w.shutdown().await;
                    }
                    drop(io);
                    self.set_disconnect_reason(DisconnectReason::LocalClosed);
                    self.tail_disconnected_or_defer();
                    return;
                }
                self.inner.writer_wake.notified().await;
                continue;
            };

            let wrote = {
                let mut io = self.inner.writer_io.lock().await;
                match io.as_mut() {
                    Some(w) => w.write(&buffer[pos..]).await,
                    None => return,
                }
            };
            match wrote {
                Ok(0) => {
                    self.write_failed(io::ErrorKind::WriteZero.into());
                    return;
                }
                Ok(n) => {
                    let finished = {
                        let mut queue = self.inner.send_queue.lock();
                        match queue.front_mut() {
                            // A cleanup pass may have swapped the front out
                            // from under the write; only advance the same
                            // message.
                            Some(si) if si.seq == seq => {
                                si.curr_pos += n;
                                si.curr_pos >= si.len
                            }
                            _ => false,
                        }
                    };
                    if finished {
                        let sent = self.inner.send_queue.lock().pop_front();
                        if let Some(si) = sent {
                            trace!(
                                "connection {} wrote message of {} bytes",
                                self.id(),
                                si.len
                            );
                            self.inner
                                .outcomes
                                .lock()
                                .push((si.owner, ConnStatus::MsgSent));
                            self.try_tail_writable();
                        }
                    }
                }
                Err(e) => {
                    self.write_failed(e);
                    return;
                }
            }
        }
    }

    fn write_failed(&self, err: io::Error) {
        error!("write on connection {} failed: {}", self.id(), err);
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, ConnState::Closed | ConnState::Terminated) {
                *state = ConnState::Closing;
            }
        }
        self.fail_queued_sends(ConnStatus::Error);
        self.set_disconnect_reason(DisconnectReason::NetworkError);
        self.tail_disconnected_or_defer();
    }

    // ---- event tails (first attempt and OOR replay share these) -----------

    pub(crate) fn try_tail_connect(&self) {
        let Some(shared) = self.shared() else { return };
        match shared.queue.reserve_cell() {
            Ok(cell) => {
                if shared
                    .queue
                    .tail(Event::Connected(self.clone()), cell)
                    .is_err()
                {
                    debug!("queue closed; dropping connected event");
                }
            }
            Err(_) => shared.oor.track_connection(self, EV_CONNECT),
        }
    }

    pub(crate) fn try_tail_writable(&self) {
        let Some(shared) = self.shared() else { return };
        self.inner.pending_writable.fetch_add(1, Ordering::SeqCst);
        match shared.queue.reserve_cell() {
            Ok(cell) => {
                if shared
                    .queue
                    .tail(Event::Writable(self.clone()), cell)
                    .is_err()
                {
                    self.inner.pending_writable.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Err(_) => {
                self.inner.pending_writable.fetch_sub(1, Ordering::SeqCst);
                shared.oor.track_connection(self, EV_WRITE);
            }
        }
    }

    fn tail_disconnected_or_defer(&self) {
        if self.inner.close_event_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        self.try_tail_close();
    }

    pub(crate) fn try_tail_close(&self) {
        let Some(shared) = self.shared() else { return };
        let reason = *self.inner.disconnect_reason.lock();
        match shared.queue.reserve_cell() {
            Ok(cell) => {
                let _ = shared
                    .queue
                    .tail(Event::Disconnected(self.clone(), reason), cell);
            }
            Err(_) => shared.oor.track_connection(self, EV_CLOSE),
        }
    }

    /// Re-invoke the same path a fresh socket notification would take.
    pub(crate) fn replay_oor(&self, bit: u8) {
        match bit {
            EV_CLOSE => self.try_tail_close(),
            EV_CONNECT => self.try_tail_connect(),
            EV_WRITE => self.try_tail_writable(),
            EV_READ => self.inner.read_resume.notify_waiters(),
            _ => {}
        }
    }

    // ---- OOR bookkeeping --------------------------------------------------

    pub(crate) fn add_oor_bits(&self, bits: u8) {
        self.inner.oor_bits.fetch_or(bits, Ordering::SeqCst);
    }

    pub(crate) fn take_oor_bits(&self, mask: u8) -> u8 {
        let mut taken = 0;
        let _ = self
            .inner
            .oor_bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                taken = cur & mask;
                Some(cur & !mask)
            });
        taken
    }

    pub(crate) fn oor_bits(&self) -> u8 {
        self.inner.oor_bits.load(Ordering::SeqCst)
    }

    pub(crate) fn test_and_set_oor_tracked(&self) -> bool {
        self.inner.oor_tracked.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_oor_tracked(&self) {
        self.inner.oor_tracked.store(false, Ordering::SeqCst);
    }

    // ---- worker-side handlers ---------------------------------------------

    fn owner_snapshot(&self) -> Vec<OwnerSlot> {
        self.inner.owners.lock().clone()
    }

    pub(crate) fn handle_connected(&self) {
        if self.inner.kind == TransportKind::Tls {
            self.set_tls_state(TlsState::Connected);
        }
        let state = self.state();
        for slot in self.owner_snapshot() {
            slot.callbacks
                .on_connection_state(self, state, DisconnectReason::Undefined);
        }
    }

    pub(crate) fn handle_writable(&self, shared: &Arc<ManagerShared>) {
        let outcomes: Vec<(OwnerId, ConnStatus)> =
            { self.inner.outcomes.lock().drain(..).collect() };
        let owners = self.owner_snapshot();
        for (owner_id, status) in outcomes {
            match status {
                ConnStatus::MsgSent => shared.stats.inc_messages_sent(),
                _ => shared.stats.inc_send_failures(),
            }
            if let Some(slot) = owners.iter().find(|s| s.id == owner_id) {
                slot.callbacks.on_connection_status(self, status);
            }
        }
        self.inner.pending_writable.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn handle_disconnected(&self, shared: &Arc<ManagerShared>, reason: DisconnectReason) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnState::Terminated {
                return;
            }
            *state = ConnState::Closed;
        }
        info!(
            "{} connection {} to {} closed ({:?})",
            self.inner.kind,
            self.id(),
            self.inner.peer,
            reason
        );

        // Anything still queued can no longer be sent.
        let unsent: Vec<OwnerId> = {
            let mut queue = self.inner.send_queue.lock();
            queue
                .drain(..)
                .filter(|si| !si.not_sent_reported)
                .map(|si| si.owner)
                .collect()
        };

        // Wake the pumps so they observe the terminal state.
        self.inner.writer_wake.notify_waiters();
        self.inner.read_resume.notify_waiters();

        shared.remove_connection(self);

        let owners = self.owner_snapshot();
        for owner_id in unsent {
            shared.stats.inc_send_failures();
            if let Some(slot) = owners.iter().find(|s| s.id == owner_id) {
                slot.callbacks.on_connection_status(self, ConnStatus::MsgNotSent);
            }
        }
        for slot in &owners {
            slot.callbacks.on_connection_state(self, ConnState::Closed, reason);
        }

        if self.inner.usage.load(Ordering::SeqCst) == 0 {
            self.terminate(shared);
        }
    }

    /// Final teardown; only reached with no owners attached.
    pub(crate) fn terminate(&self, shared: &Arc<ManagerShared>) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnState::Terminated {
                return;
            }
            *state = ConnState::Terminated;
        }
        debug!("connection {} terminated", self.id());
        shared.remove_connection(self);
        let tasks: Vec<JoinHandle<()>> = { self.inner.tasks.lock().drain(..).collect() };
        for task in tasks {
            task.abort();
        }
        self.inner.send_queue.lock().clear();
        self.inner.outcomes.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn with_send_queue<R>(&self, f: impl FnOnce(&VecDeque<SendInfo>) -> R) -> R {
        f(&self.inner.send_queue.lock())
    }
}

fn reserve_event_pair(
    shared: &Arc<ManagerShared>,
) -> Result<(crate::events::CellPermit, crate::events::RecvBuffer)> {
    let cell = shared.queue.reserve_cell()?;
    let buf = shared.queue.reserve_recv_buffer()?;
    Ok((cell, buf))
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection({} {} -> {}, {:?})",
            self.inner.kind,
            self.id(),
            self.inner.peer,
            self.state()
        )
    }
}

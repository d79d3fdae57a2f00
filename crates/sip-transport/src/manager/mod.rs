//! The transport manager: owner of sockets, indexes, pools and workers.
//!
//! One manager instance holds the whole engine together: the bounded event
//! queue, the OOR recovery registry, the local-address and connection
//! indexes, the UDP send buffer, and the worker pool that drains events.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Error, ResourceKind, Result};
use crate::events::{Event, EventQueue, ObjectEvent, OorRegistry, QueuedEvent, ResourceFreed};
use crate::transmitter::{DestinationResolver, Transmitter, TransmitterObserver};
use crate::transport::{Connection, LocalAddress, MessageSink, SendGate, TransportKind};

/// Index key for the connection table
type ConnKey = (TransportKind, SocketAddr, SocketAddr);

/// Diagnostic counters for pools, queues and tables
#[derive(Debug, Clone)]
pub struct ResourcesStatus {
    pub event_cells_used: usize,
    pub event_cells_capacity: usize,
    pub event_cells_high_water: usize,
    pub recv_buffers_used: usize,
    pub recv_buffers_capacity: usize,
    pub recv_buffers_high_water: usize,
    pub connections: usize,
    pub max_connections: usize,
    pub local_addresses: usize,
    pub max_local_addresses: usize,
    pub oor_tracked_connections: usize,
    pub oor_deferred_events: usize,
    pub oor_deferrals_total: u64,
    pub events_dispatched: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
}

#[derive(Default)]
pub(crate) struct Stats {
    events_dispatched: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    oor_deferrals: AtomicU64,
}

impl Stats {
    pub(crate) fn inc_events_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn inc_oor_deferrals(&self) {
        self.oor_deferrals.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct ManagerShared {
    pub(crate) config: TransportConfig,
    pub(crate) queue: EventQueue,
    pub(crate) oor: Arc<OorRegistry>,
    locals: DashMap<(TransportKind, SocketAddr), LocalAddress>,
    conns: DashMap<ConnKey, Connection>,
    aliases: DashMap<String, Connection>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    gate: RwLock<Option<Arc<dyn SendGate>>>,
    /// Fixed send buffer serializing UDP sends
    pub(crate) udp_send_buf: AsyncMutex<BytesMut>,
    udp_paused: AtomicBool,
    udp_resume: Notify,
    next_conn_id: AtomicU64,
    pub(crate) stats: Stats,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.sink.read().clone()
    }

    pub(crate) fn send_gate(&self) -> Option<Arc<dyn SendGate>> {
        self.gate.read().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Index a new connection, enforcing the connection capacity limit.
    pub(crate) fn register_connection(&self, conn: &Connection) -> Result<()> {
        if self.conns.len() >= self.config.max_connections {
            return Err(Error::OutOfResources(ResourceKind::Connections));
        }
        let key = (conn.kind(), conn.local_addr(), conn.peer_addr());
        // A replaced entry stays alive through its own handles; it is
        // simply no longer found for reuse.
        self.conns.insert(key, conn.clone());
        Ok(())
    }

    pub(crate) fn remove_connection(&self, conn: &Connection) {
        let key = (conn.kind(), conn.local_addr(), conn.peer_addr());
        self.conns.remove_if(&key, |_, c| c.id() == conn.id());
        if let Some(alias) = conn.alias() {
            self.aliases.remove_if(&alias, |_, c| c.id() == conn.id());
        }
    }

    /// Enqueue an object event without the deferral fallback; used by the
    /// OOR replay pass.
    pub(crate) fn try_enqueue_object_event(&self, event: ObjectEvent) -> Result<()> {
        let cell = self.queue.reserve_cell()?;
        self.queue.tail(Event::Object(event), cell)
    }

    /// Pick a local address able to reach `dest` over `kind`.
    pub(crate) fn local_for_destination(
        &self,
        kind: TransportKind,
        dest: SocketAddr,
    ) -> Result<LocalAddress> {
        self.locals
            .iter()
            .find(|entry| {
                let key = entry.key();
                key.0 == kind && key.1.is_ipv4() == dest.is_ipv4()
            })
            .map(|e| e.value().clone())
            .ok_or(Error::NotFound)
    }

    pub(crate) fn connection_for(
        &self,
        kind: TransportKind,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Option<Connection> {
        self.conns.get(&(kind, local, peer)).map(|e| e.value().clone())
    }

    /// Reuse a usable connection for the route, or lazily construct one.
    pub(crate) fn usable_or_construct(
        self: &Arc<Self>,
        kind: TransportKind,
        local: &LocalAddress,
        peer: SocketAddr,
    ) -> Result<Connection> {
        if let Some(conn) = self.connection_for(kind, local.bound_addr(), peer) {
            if conn.is_usable(kind, local.bound_addr(), peer, false) {
                trace!("reusing connection {} for {}", conn.id(), peer);
                return Ok(conn);
            }
        }
        if self.is_closed() {
            return Err(Error::IllegalAction("manager is shut down"));
        }
        Connection::construct(self, kind, local.clone(), peer)
    }

    pub(crate) fn register_alias(&self, alias: &str, conn: &Connection) {
        conn.set_alias_value(alias);
        self.aliases.insert(alias.to_string(), conn.clone());
    }

    // ---- UDP read-side backpressure ---------------------------------------

    pub(crate) fn udp_reads_paused(&self) -> bool {
        self.udp_paused.load(Ordering::SeqCst)
    }

    pub(crate) fn pause_udp_reads(&self) {
        if !self.udp_paused.swap(true, Ordering::SeqCst) {
            warn!("UDP reads paused until receive capacity returns");
        }
    }

    /// Wait until UDP reads resume. The wakeup is registered before the
    /// flag is re-checked so a racing resume cannot be missed.
    pub(crate) async fn udp_resume_notified(&self) {
        let notified = self.udp_resume.notified();
        if !self.udp_reads_paused() {
            return;
        }
        notified.await;
    }

    fn resume_udp_reads(&self) {
        if self.udp_paused.swap(false, Ordering::SeqCst) {
            debug!("UDP reads resumed");
            self.udp_resume.notify_waiters();
        }
    }

    /// Entry point for the pool release hooks.
    pub(crate) fn on_resource_available(self: &Arc<Self>, reason: ResourceFreed) {
        if self.is_closed() {
            return;
        }
        // Resume UDP only once a datagram can actually be delivered, or a
        // failed cell+buffer reservation would wake the readers right back
        // into the same wall.
        if self.udp_reads_paused()
            && self.queue.cells().has_capacity()
            && self.queue.buffers().has_capacity()
        {
            self.resume_udp_reads();
        }
        self.oor.on_resource_available(reason, self);
    }
}

/// Handle to the transport engine
#[derive(Clone)]
pub struct TransportManager {
    shared: Arc<ManagerShared>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        let queue = EventQueue::new(
            config.event_queue_capacity,
            config.recv_buffer_pool_capacity,
            config.max_buffer_size,
        );
        let send_buf = BytesMut::with_capacity(config.max_buffer_size);
        let shared = Arc::new(ManagerShared {
            config,
            queue,
            oor: OorRegistry::new(),
            locals: DashMap::new(),
            conns: DashMap::new(),
            aliases: DashMap::new(),
            sink: RwLock::new(None),
            gate: RwLock::new(None),
            udp_send_buf: AsyncMutex::new(send_buf),
            udp_paused: AtomicBool::new(false),
            udp_resume: Notify::new(),
            next_conn_id: AtomicU64::new(1),
            stats: Stats::default(),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Pool releases feed straight into OOR recovery.
        let weak = Arc::downgrade(&shared);
        shared
            .queue
            .set_resource_hook(Arc::new(move |reason: ResourceFreed| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_resource_available(reason);
                }
            }));

        Self { shared }
    }

    /// Spawn the worker pool. With `worker_tasks == 0` nothing is spawned
    /// and the owner drains events through [`dispatch_one`](Self::dispatch_one).
    pub fn start(&self) {
        let count = self.shared.config.worker_tasks;
        if count == 0 {
            debug!("no worker pool; events are dispatched inline by the owner");
            return;
        }
        let mut workers = self.shared.workers.lock();
        for worker in 0..count {
            let shared = self.shared.clone();
            workers.push(tokio::spawn(async move {
                debug!("event worker {} started", worker);
                loop {
                    let Some(event) = shared.queue.pop().await else {
                        break;
                    };
                    let requeued = dispatch(&shared, event);
                    if requeued {
                        // Let the event in front of the requeued one run.
                        tokio::task::yield_now().await;
                    }
                }
                debug!("event worker {} stopped", worker);
            }));
        }
        info!("transport manager started with {} worker task(s)", count);
    }

    /// Pop and dispatch a single event; `false` once the queue is closed.
    pub async fn dispatch_one(&self) -> bool {
        match self.shared.queue.pop().await {
            Some(event) => {
                dispatch(&self.shared, event);
                true
            }
            None => false,
        }
    }

    /// Close the engine: terminate connections, close sockets, drain and
    /// stop the workers.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("transport manager shutting down");

        let conns: Vec<Connection> = self.shared.conns.iter().map(|e| e.value().clone()).collect();
        for conn in conns {
            conn.terminate(&self.shared);
        }
        self.shared.conns.clear();
        self.shared.aliases.clear();

        let locals: Vec<LocalAddress> =
            self.shared.locals.iter().map(|e| e.value().clone()).collect();
        for local in locals {
            local.close();
        }
        self.shared.locals.clear();

        self.shared.queue.close();
        let workers: Vec<JoinHandle<()>> = { self.shared.workers.lock().drain(..).collect() };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Install the upward message boundary (the parsing layer).
    pub fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    /// Install an outbound pacing hook.
    pub fn set_send_gate(&self, gate: Arc<dyn SendGate>) {
        *self.shared.gate.write() = Some(gate);
    }

    /// Direct access to the event queue (allocation and tailing are part
    /// of the engine's contract with its collaborators).
    pub fn event_queue(&self) -> &EventQueue {
        &self.shared.queue
    }

    // ---- local addresses --------------------------------------------------

    /// Bind a local address. (transport, address) is unique per manager.
    pub async fn open_local_address(
        &self,
        kind: TransportKind,
        addr: SocketAddr,
    ) -> Result<LocalAddress> {
        if self.shared.is_closed() {
            return Err(Error::IllegalAction("manager is shut down"));
        }
        if self.shared.locals.len() >= self.shared.config.max_local_addresses {
            return Err(Error::OutOfResources(ResourceKind::LocalAddresses));
        }
        if addr.port() != 0 && self.shared.locals.contains_key(&(kind, addr)) {
            return Err(Error::IllegalAction("local address already open"));
        }
        let local = LocalAddress::open(&self.shared, kind, addr).await?;
        self.shared
            .locals
            .insert((kind, local.bound_addr()), local.clone());
        Ok(local)
    }

    /// Look up a bound local address by (transport, address).
    pub fn local_address(&self, kind: TransportKind, addr: SocketAddr) -> Result<LocalAddress> {
        self.shared
            .locals
            .get(&(kind, addr))
            .map(|e| e.value().clone())
            .ok_or(Error::NotFound)
    }

    /// Pick a local address able to reach `dest` over `kind`.
    pub fn local_for_destination(
        &self,
        kind: TransportKind,
        dest: SocketAddr,
    ) -> Result<LocalAddress> {
        self.shared.local_for_destination(kind, dest)
    }

    /// Unregister and close a local address.
    pub fn close_local_address(&self, kind: TransportKind, addr: SocketAddr) -> Result<()> {
        let (_, local) = self
            .shared
            .locals
            .remove(&(kind, addr))
            .ok_or(Error::NotFound)?;
        local.close();
        Ok(())
    }

    // ---- connections ------------------------------------------------------

    /// Look up a connection by its route key.
    pub fn connection(
        &self,
        kind: TransportKind,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Option<Connection> {
        self.shared.connection_for(kind, local, peer)
    }

    /// Look up a connection by an application-supplied alias.
    pub fn connection_by_alias(&self, alias: &str) -> Option<Connection> {
        self.shared.aliases.get(alias).map(|e| e.value().clone())
    }

    /// Construct a fresh outbound connection in the `Ready` state.
    pub fn construct_connection(
        &self,
        kind: TransportKind,
        local: &LocalAddress,
        peer: SocketAddr,
    ) -> Result<Connection> {
        if self.shared.is_closed() {
            return Err(Error::IllegalAction("manager is shut down"));
        }
        Connection::construct(&self.shared, kind, local.clone(), peer)
    }

    /// Reuse a usable connection for the route, or lazily construct one.
    pub fn usable_connection_or_construct(
        &self,
        kind: TransportKind,
        local: &LocalAddress,
        peer: SocketAddr,
    ) -> Result<Connection> {
        self.shared.usable_or_construct(kind, local, peer)
    }

    /// Register an alias for later [`connection_by_alias`](Self::connection_by_alias) lookup.
    pub fn register_alias(&self, alias: &str, conn: &Connection) {
        self.shared.register_alias(alias, conn);
    }

    // ---- object events and timers -----------------------------------------

    /// Enqueue a deferred callback at an arbitrary manager-owned object.
    ///
    /// Queue exhaustion is absorbed: the event is parked in the OOR
    /// registry and replayed when capacity returns.
    pub fn send_object_event(&self, event: ObjectEvent) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::IllegalAction("manager is shut down"));
        }
        match self.shared.try_enqueue_object_event(event.clone()) {
            Ok(()) => Ok(()),
            Err(Error::OutOfResources(_)) => {
                self.shared.stats.inc_oor_deferrals();
                self.shared.oor.defer_object_event(event);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fire an object event after `delay`, as a TimerExpired event.
    pub fn schedule_timer(&self, delay: Duration, event: ObjectEvent) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.is_closed() {
                return;
            }
            match shared.queue.reserve_cell() {
                Ok(cell) => {
                    let _ = shared.queue.tail(Event::TimerExpired(event), cell);
                }
                Err(_) => {
                    shared.stats.inc_oor_deferrals();
                    shared.oor.defer_object_event(event);
                }
            }
        });
    }

    // ---- transmitters -----------------------------------------------------

    pub fn new_transmitter(
        &self,
        resolver: Arc<dyn DestinationResolver>,
        observer: Arc<dyn TransmitterObserver>,
    ) -> Transmitter {
        Transmitter::new(&self.shared, resolver, observer)
    }

    // ---- diagnostics ------------------------------------------------------

    pub fn resources_status(&self) -> ResourcesStatus {
        let shared = &self.shared;
        ResourcesStatus {
            event_cells_used: shared.queue.cells().used(),
            event_cells_capacity: shared.queue.cells().capacity(),
            event_cells_high_water: shared.queue.cells().high_water(),
            recv_buffers_used: shared.queue.buffers().outstanding(),
            recv_buffers_capacity: shared.queue.buffers().capacity(),
            recv_buffers_high_water: shared.queue.buffers().high_water(),
            connections: shared.conns.len(),
            max_connections: shared.config.max_connections,
            local_addresses: shared.locals.len(),
            max_local_addresses: shared.config.max_local_addresses,
            oor_tracked_connections: shared.oor.tracked_connections(),
            oor_deferred_events: shared.oor.deferred_object_events(),
            oor_deferrals_total: shared.stats.oor_deferrals.load(Ordering::Relaxed),
            events_dispatched: shared.stats.events_dispatched.load(Ordering::Relaxed),
            messages_received: shared.stats.messages_received.load(Ordering::Relaxed),
            messages_sent: shared.stats.messages_sent.load(Ordering::Relaxed),
            send_failures: shared.stats.send_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}

/// Dispatch one popped event. Returns true if the event was requeued
/// instead of processed.
pub(crate) fn dispatch(shared: &Arc<ManagerShared>, event: QueuedEvent) -> bool {
    // Finish writing before tearing down: a Disconnected event never
    // overtakes a still-queued Writable event for the same connection.
    if let Event::Disconnected(conn, _) = &event.event {
        if conn.pending_writable() > 0 {
            trace!(
                "requeueing disconnect for connection {} behind pending write",
                conn.id()
            );
            let _ = shared.queue.retail(event);
            return true;
        }
    }

    shared.stats.inc_events_dispatched();
    match &event.event {
        Event::MessageReceived {
            data,
            source,
            local,
            connection,
            hints,
        } => {
            shared.stats.inc_messages_received();
            match shared.sink() {
                Some(sink) => {
                    sink.on_message(data.data(), *source, local, connection.as_ref(), *hints)
                }
                None => debug!("message from {} dropped: no message sink installed", source),
            }
        }
        Event::Connected(conn) => conn.handle_connected(),
        Event::Disconnected(conn, reason) => conn.handle_disconnected(shared, *reason),
        Event::Writable(conn) => conn.handle_writable(shared),
        Event::TimerExpired(ev) => ev.invoke(),
        Event::Object(ev) => ev.invoke(),
    }
    false
}

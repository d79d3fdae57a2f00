//! Local addresses: bound sockets and their I/O loops.
//!
//! A [`LocalAddress`] is one bound socket: a UDP socket with its read loop,
//! or a listening endpoint for the stream transports. Uniqueness per
//! (transport, address) is enforced by the manager's index.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::{Event, FramingHints};
use crate::manager::ManagerShared;

use super::connection::Connection;
use super::TransportKind;

pub(crate) struct LocalAddrInner {
    kind: TransportKind,
    bound: Mutex<SocketAddr>,
    manager: Weak<ManagerShared>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one bound local address
#[derive(Clone)]
pub struct LocalAddress {
    inner: Arc<LocalAddrInner>,
}

impl LocalAddress {
    /// Bind a socket for `kind` on `addr` and start its I/O loop.
    pub(crate) async fn open(
        shared: &Arc<ManagerShared>,
        kind: TransportKind,
        addr: SocketAddr,
    ) -> Result<LocalAddress> {
        let local = LocalAddress {
            inner: Arc::new(LocalAddrInner {
                kind,
                bound: Mutex::new(addr),
                manager: Arc::downgrade(shared),
                udp: Mutex::new(None),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        match kind {
            TransportKind::Udp => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|e| Error::BindFailed(addr, e))?;
                let bound = socket.local_addr()?;
                info!("SIP UDP local address bound to {}", bound);
                *local.inner.bound.lock() = bound;
                *local.inner.udp.lock() = Some(Arc::new(socket));
                local.spawn_udp_read(shared.clone());
            }
            TransportKind::Tcp => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::BindFailed(addr, e))?;
                let bound = listener.local_addr()?;
                info!("SIP TCP local address listening on {}", bound);
                *local.inner.bound.lock() = bound;
                local.spawn_accept(listener, shared.clone());
            }
            TransportKind::Tls => {
                #[cfg(feature = "tls")]
                {
                    let listener = TcpListener::bind(addr)
                        .await
                        .map_err(|e| Error::BindFailed(addr, e))?;
                    let bound = listener.local_addr()?;
                    info!("SIP TLS local address listening on {}", bound);
                    *local.inner.bound.lock() = bound;
                    local.spawn_accept(listener, shared.clone());
                }
                #[cfg(not(feature = "tls"))]
                {
                    return Err(Error::IllegalAction("TLS support not compiled in"));
                }
            }
            TransportKind::Sctp => {
                #[cfg(all(feature = "sctp", unix))]
                {
                    let listener = super::sctp::listen(addr).await?;
                    let bound = listener.local_addr()?;
                    info!("SIP SCTP local address listening on {}", bound);
                    *local.inner.bound.lock() = bound;
                    local.spawn_accept(listener, shared.clone());
                }
                #[cfg(not(all(feature = "sctp", unix)))]
                {
                    return Err(Error::IllegalAction("SCTP support not compiled in"));
                }
            }
        }

        Ok(local)
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// The address actually bound (resolves port 0 to the assigned port)
    pub fn bound_addr(&self) -> SocketAddr {
        *self.inner.bound.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.inner.udp.lock().clone()
    }

    /// Stop the I/O loop and release the socket.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "closing {} local address {}",
            self.inner.kind,
            self.bound_addr()
        );
        *self.inner.udp.lock() = None;
        let tasks: Vec<JoinHandle<()>> = { self.inner.tasks.lock().drain(..).collect() };
        for task in tasks {
            task.abort();
        }
    }

    /// Rebind the UDP socket on the same address after a socket error.
    pub(crate) async fn reopen(&self) -> Result<()> {
        if self.inner.kind != TransportKind::Udp {
            return Err(Error::IllegalAction("reopen is a UDP operation"));
        }
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        let addr = self.bound_addr();
        // Drop the old socket before rebinding the same port.
        *self.inner.udp.lock() = None;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::BindFailed(addr, e))?;
        info!("reopened UDP socket on {}", addr);
        *self.inner.udp.lock() = Some(Arc::new(socket));
        Ok(())
    }

    /// Send one datagram.
    ///
    /// Sends are serialized through the manager's fixed send buffer; an
    /// optional [`SendGate`](super::SendGate) may suppress the
    /// transmission. Zero bytes written is a benign would-block.
    pub async fn send_message(&self, data: &[u8], dest: SocketAddr) -> Result<usize> {
        let shared = self.inner.manager.upgrade().ok_or(Error::InvalidHandle)?;
        if self.inner.kind != TransportKind::Udp {
            return Err(Error::IllegalAction("send_message is a UDP operation"));
        }
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        if data.len() > shared.config.max_buffer_size {
            return Err(Error::InsufficientBuffer {
                message_len: data.len(),
                buffer_len: shared.config.max_buffer_size,
            });
        }

        let mut buf = shared.udp_send_buf.lock().await;
        buf.clear();
        buf.extend_from_slice(data);

        if let Some(gate) = shared.send_gate() {
            if !gate.allow_send(dest, buf.len()) {
                debug!("send gate suppressed {} byte datagram to {}", buf.len(), dest);
                return Ok(0);
            }
        }

        let socket = self.udp_socket().ok_or(Error::InvalidHandle)?;
        match socket.send_to(&buf[..], dest).await {
            Ok(0) => {
                debug!("UDP send to {} wrote zero bytes; would-block", dest);
                Ok(0)
            }
            Ok(n) => {
                trace!("sent {} bytes to {}", n, dest);
                shared.stats.inc_messages_sent();
                Ok(n)
            }
            Err(e) => {
                warn!("UDP send to {} failed: {}", dest, e);
                shared.stats.inc_send_failures();
                if shared.config.reopen_on_socket_error {
                    let _ = self.reopen().await;
                }
                Err(Error::NetworkProblem(e.to_string()))
            }
        }
    }

    fn spawn_udp_read(&self, shared: Arc<ManagerShared>) {
        let local = self.clone();
        let handle = tokio::spawn(async move {
            run_udp_read(local, shared).await;
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_accept(&self, listener: TcpListener, shared: Arc<ManagerShared>) {
        let local = self.clone();
        let handle = tokio::spawn(async move {
            run_accept(local, listener, shared).await;
        });
        self.inner.tasks.lock().push(handle);
    }
}

impl fmt::Debug for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalAddress({} {})", self.inner.kind, self.bound_addr())
    }
}

/// UDP read loop: drain datagrams within the configured budget, one pooled
/// event + buffer per datagram. Allocation failure pauses every UDP socket
/// until the recovery machinery signals capacity.
async fn run_udp_read(local: LocalAddress, shared: Arc<ManagerShared>) {
    let budget = shared.config.udp_drain_budget.max(1);

    'outer: while !local.is_closed() {
        if shared.udp_reads_paused() {
            shared.udp_resume_notified().await;
            continue;
        }
        let Some(socket) = local.udp_socket() else {
            break;
        };
        if let Err(e) = socket.readable().await {
            if local.is_closed() {
                break;
            }
            error!("UDP socket {} readiness failed: {}", local.bound_addr(), e);
            if shared.config.reopen_on_socket_error {
                if local.reopen().await.is_err() {
                    break;
                }
                continue;
            }
            break;
        }

        for _ in 0..budget {
            // Allocate before reading so nothing is pulled off the socket
            // without a place to put it.
            let pair = shared
                .queue
                .reserve_cell()
                .and_then(|cell| shared.queue.reserve_recv_buffer().map(|buf| (cell, buf)));
            let (cell, mut buf) = match pair {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("no receive capacity for UDP ({}); pausing UDP reads", e);
                    shared.pause_udp_reads();
                    continue 'outer;
                }
            };

            match socket.try_recv_from(buf.as_mut_slice()) {
                Ok((n, src)) => {
                    if n == 0 {
                        // No more data; end the burst.
                        break;
                    }
                    if n >= buf.buffer_size() {
                        warn!(
                            "UDP datagram from {} truncated at {} bytes; dropped",
                            src, n
                        );
                        continue;
                    }
                    trace!("received {} bytes from {}", n, src);
                    buf.set_len(n);
                    let event = Event::MessageReceived {
                        data: buf,
                        source: src,
                        local: local.clone(),
                        connection: None,
                        hints: FramingHints::from_total(n),
                    };
                    let _ = shared.queue.tail(event, cell);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("UDP receive on {} failed: {}", local.bound_addr(), e);
                    if shared.config.reopen_on_socket_error {
                        if local.reopen().await.is_err() {
                            break 'outer;
                        }
                    }
                    break;
                }
            }
        }
    }
    debug!("UDP read loop for {} terminated", local.bound_addr());
}

/// Accept loop for the stream transports; each accepted stream is adopted
/// on its own task so a slow TLS handshake cannot stall the listener.
async fn run_accept(local: LocalAddress, listener: TcpListener, shared: Arc<ManagerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if local.is_closed() {
                    return;
                }
                debug!("accepted {} stream from {}", local.kind(), peer);
                let local = local.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    adopt_accepted(local, shared, stream, peer).await;
                });
            }
            Err(e) => {
                if local.is_closed() {
                    return;
                }
                warn!("accept on {} failed: {}", local.bound_addr(), e);
            }
        }
    }
}

async fn adopt_accepted(
    local: LocalAddress,
    shared: Arc<ManagerShared>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let kind = local.kind();
    let result = match kind {
        TransportKind::Tcp | TransportKind::Sctp => {
            let (r, w) = stream.into_split();
            Connection::adopt(&shared, kind, local, peer, Box::new(r), Box::new(w), false).await
        }
        #[cfg(feature = "tls")]
        TransportKind::Tls => {
            let acceptor = match shared.config.tls.as_ref() {
                Some(settings) => match settings.acceptor() {
                    Ok(acceptor) => acceptor,
                    Err(e) => {
                        warn!("TLS accept from {} failed: {}", peer, e);
                        return;
                    }
                },
                None => {
                    warn!("TLS stream from {} but no TLS settings configured", peer);
                    return;
                }
            };
            match acceptor.accept(stream).await {
                Ok(tls) => {
                    let (r, w) = tokio::io::split(tls);
                    Connection::adopt(&shared, kind, local, peer, Box::new(r), Box::new(w), true)
                        .await
                }
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            }
        }
        _ => return,
    };
    if let Err(e) = result {
        warn!("failed to adopt inbound connection from {}: {}", peer, e);
    }
}

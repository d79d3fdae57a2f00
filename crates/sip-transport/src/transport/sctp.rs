//! One-to-one SCTP sockets.
//!
//! SCTP in one-to-one style (SOCK_STREAM) speaks the ordinary stream socket
//! API, so an association can be driven through tokio's TCP types once the
//! socket is created with the SCTP protocol. Messages go out on stream 0;
//! the per-message stream id carried in `SendFlags` is reserved for a
//! sendmsg-based path.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};

/// Connect a one-to-one SCTP association to `peer`.
pub(crate) async fn connect(peer: SocketAddr) -> Result<TcpStream> {
    let stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
        let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::SCTP))?;
        socket.connect(&peer.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
    .await
    .map_err(|e| Error::NetworkProblem(format!("SCTP connect task failed: {}", e)))?
    .map_err(|e| Error::ConnectFailed(peer, e.to_string()))?;
    TcpStream::from_std(stream).map_err(Error::from)
}

/// Bind and listen for one-to-one SCTP associations on `addr`.
pub(crate) async fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let listener = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::SCTP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
    .await
    .map_err(|e| Error::NetworkProblem(format!("SCTP listen task failed: {}", e)))?
    .map_err(|e| Error::BindFailed(addr, e))?;
    TcpListener::from_std(listener).map_err(Error::from)
}

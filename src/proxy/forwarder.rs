//! Data forwarding module
//!
//! Connects to the selected backend, sends the replay buffer first and then
//! relays both directions until they are closed. EOF on one side is turned
//! into a write shutdown toward the other peer; the opposite direction keeps
//! flowing until it ends too.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::common::{ProxyError, Result};
use crate::config::defaults;
use crate::protocol::EntryFlags;

use super::router::RoutingDecision;

/// Backend connection and relay settings
#[derive(Debug, Clone, Copy)]
pub struct ShovelOptions {
    pub connect_timeout: Duration,
    /// Per-direction relay buffer
    pub transfer_buffer_size: usize,
}

impl Default for ShovelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(defaults::connect_timeout()),
            transfer_buffer_size: defaults::transfer_buffer_size(),
        }
    }
}

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes consumed while probing and replayed to the backend
    pub replayed: usize,
    /// Bytes relayed from the client after the replay
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Open the backend connection for an entry
///
/// With `transparent` the socket is bound to the client's address so the
/// backend sees the real peer. This needs `CAP_NET_ADMIN` and matching
/// routing rules, and is only available for IPv4 on Linux.
pub async fn connect_backend(
    addr: SocketAddr,
    flags: EntryFlags,
    client_addr: SocketAddr,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if flags.keepalive {
        socket.set_keepalive(true)?;
    }
    if flags.transparent {
        bind_transparent(&socket, client_addr)?;
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    timeout(connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection timed out"))?
}

#[cfg(target_os = "linux")]
fn bind_transparent(socket: &Socket, client_addr: SocketAddr) -> io::Result<()> {
    match client_addr.ip() {
        IpAddr::V4(ip) => {
            socket.set_ip_transparent(true)?;
            socket.bind(&SocketAddr::new(IpAddr::V4(ip), 0).into())
        }
        IpAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent proxying is only supported for IPv4 clients",
        )),
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_transparent(_socket: &Socket, _client_addr: SocketAddr) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent proxying is only supported on Linux",
    ))
}

/// Connect to the decided backend and relay the connection until it closes
///
/// The client is closed without any replay if the backend cannot be reached.
///
/// # Parameters
///
/// * `client` - Accepted client stream, positioned after the probed bytes
/// * `decision` - Routing decision carrying the entry, backend and replay
/// * `client_addr` - Client address, used for transparent binding and logs
/// * `options` - Connect timeout and relay buffer size
///
/// # Returns
///
/// Byte counts once both directions are closed. A failed connect is a
/// `RoutingFailure`; an I/O error while relaying is `Relay`.
pub async fn shovel(
    client: TcpStream,
    decision: RoutingDecision,
    client_addr: SocketAddr,
    options: &ShovelOptions,
) -> Result<RelayStats> {
    let entry = &decision.protocol;
    let backend = connect_backend(decision.backend, entry.flags, client_addr, options.connect_timeout)
        .await
        .map_err(|e| ProxyError::routing(&entry.name, format!("{}: {}", decision.backend, e)))?;
    debug!("Connected to {} backend {}", entry.name, decision.backend);

    if entry.flags.keepalive {
        if let Err(e) = SockRef::from(&client).set_keepalive(true) {
            debug!("Failed to enable keepalive for {}: {}", client_addr, e);
        }
    }

    relay(client, backend, decision.replay, options.transfer_buffer_size)
        .await
        .map_err(ProxyError::Relay)
}

/// Relay between two streams, after sending `replay` to the backend
///
/// # Parameters
///
/// * `client` - Client side of the connection
/// * `backend` - Backend side of the connection
/// * `replay` - Bytes read from the client while probing, sent first
/// * `buffer_size` - Per-direction transfer buffer
///
/// # Returns
///
/// Returns when both directions have reached EOF, or on the first I/O error,
/// at which point both streams are dropped.
pub async fn relay<C, B>(client: C, backend: B, replay: Bytes, buffer_size: usize) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut backend_reader, mut backend_writer) = tokio::io::split(backend);

    backend_writer.write_all(&replay).await?;
    backend_writer.flush().await?;
    trace!("Replayed {} bytes", replay.len());

    let (client_to_backend, backend_to_client) = tokio::try_join!(
        copy_half(&mut client_reader, &mut backend_writer, buffer_size, "client -> backend"),
        copy_half(&mut backend_reader, &mut client_writer, buffer_size, "backend -> client"),
    )?;

    Ok(RelayStats {
        replayed: replay.len(),
        client_to_backend,
        backend_to_client,
    })
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize, direction: &str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        total += n as u64;
    }

    // The peer may already be gone
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown {} failed: {}", direction, e);
    }
    debug!("{} closed after {} bytes", direction, total);
    Ok(total)
}

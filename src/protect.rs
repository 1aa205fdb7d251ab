//! Outbound socket protection
//!
//! Every socket the relays open towards a real server would itself be routed
//! into the TUN device and come straight back to the dispatcher. The host
//! breaks that loop by excluding the socket from the virtual interface (on
//! Android, `VpnService.protect(fd)`). Shards and the UDP relay hand each
//! socket to the [`SocketProtector`] after creating it and before connecting:
//!
//! ```text
//! socket2::Socket::new ──► SocketProtector::protect(OutboundSocket) ──► connect ──► mio
//!                                   │ Err
//!                                   ▼
//!                          ProxyError::ProtectFailed (pair / tunnel dropped,
//!                                                     unreachable event posted)
//! ```
//!
//! Any `Fn(&OutboundSocket) -> io::Result<()>` closure is a protector, which
//! is the usual shape of an FFI callback:
//!
//! ```
//! use std::sync::Arc;
//! use tun_interceptor::protect::{OutboundSocket, SocketProtector};
//!
//! let protector: Arc<dyn SocketProtector> = Arc::new(|socket: &OutboundSocket| -> std::io::Result<()> {
//!     assert!(socket.fd >= 0);
//!     Ok(())
//! });
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::error::ProxyError;

/// Which relay is opening the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// Remote half of a TCP tunnel pair, opened by a proxy shard
    TcpShard,
    /// Connected datagram socket of the UDP relay
    UdpRelay,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TcpShard => write!(f, "tcp"),
            Self::UdpRelay => write!(f, "udp"),
        }
    }
}

/// An outbound socket waiting to be protected
#[derive(Debug, Clone, Copy)]
pub struct OutboundSocket {
    /// Raw descriptor, not yet connected
    pub fd: RawFd,
    pub kind: RelayKind,
    /// Real server the socket will connect to
    pub remote: SocketAddr,
}

/// Host hook that keeps relay sockets out of the virtual interface
pub trait SocketProtector: Send + Sync {
    /// # Errors
    ///
    /// An error means the host refused; the socket is closed and the flow
    /// reported unreachable.
    fn protect(&self, socket: &OutboundSocket) -> io::Result<()>;
}

impl<F> SocketProtector for F
where
    F: Fn(&OutboundSocket) -> io::Result<()> + Send + Sync,
{
    fn protect(&self, socket: &OutboundSocket) -> io::Result<()> {
        self(socket)
    }
}

/// Protector for hosts whose routing never sends relay traffic back into
/// the tunnel (tests, desktop setups with policy routing)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSocketProtector;

impl SocketProtector for NoOpSocketProtector {
    fn protect(&self, _socket: &OutboundSocket) -> io::Result<()> {
        Ok(())
    }
}

/// Create a socket for `remote` and run it past the protector
fn protected_socket(
    remote: SocketAddr,
    kind: RelayKind,
    protector: &dyn SocketProtector,
) -> Result<Socket, ProxyError> {
    let (ty, protocol) = match kind {
        RelayKind::TcpShard => (Type::STREAM, Protocol::TCP),
        RelayKind::UdpRelay => (Type::DGRAM, Protocol::UDP),
    };
    let socket = Socket::new(Domain::for_address(remote), ty, Some(protocol))?;
    let outbound = OutboundSocket {
        fd: socket.as_raw_fd(),
        kind,
        remote,
    };
    if let Err(e) = protector.protect(&outbound) {
        debug!(fd = outbound.fd, %kind, %remote, "Host refused socket protection: {}", e);
        return Err(ProxyError::ProtectFailed {
            remote,
            reason: e.to_string(),
        });
    }
    trace!(fd = outbound.fd, %kind, %remote, "Socket protected");
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Open the remote half of a TCP tunnel pair
///
/// The connect is still in progress when this returns; the shard's reactor
/// sees it complete as writable readiness.
///
/// # Errors
///
/// Returns `ProxyError::ProtectFailed` if the host refused protection, or
/// `ProxyError::ConnectionFailed` if the connect failed immediately.
pub fn connect_protected_stream(
    remote: SocketAddr,
    protector: &dyn SocketProtector,
) -> Result<mio::net::TcpStream, ProxyError> {
    let socket = protected_socket(remote, RelayKind::TcpShard, protector)?;
    socket.set_nodelay(true)?;
    match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(ProxyError::connection_failed(remote, e.to_string())),
    }
    let stream: std::net::TcpStream = socket.into();
    Ok(mio::net::TcpStream::from_std(stream))
}

/// Open the UDP relay's socket for one client source port
///
/// # Errors
///
/// Returns `ProxyError::ProtectFailed` if the host refused protection, or
/// `ProxyError::ConnectionFailed` if the socket could not be connected.
pub fn connect_protected_datagram(
    remote: SocketAddr,
    protector: &dyn SocketProtector,
) -> Result<mio::net::UdpSocket, ProxyError> {
    let socket = protected_socket(remote, RelayKind::UdpRelay, protector)?;
    socket
        .connect(&SockAddr::from(remote))
        .map_err(|e| ProxyError::connection_failed(remote, e.to_string()))?;
    let datagram: std::net::UdpSocket = socket.into();
    Ok(mio::net::UdpSocket::from_std(datagram))
}

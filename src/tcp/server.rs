//! TCP proxy shard
//!
//! Each shard owns one listening socket and one reactor thread. Connections
//! arriving from the NAT are matched to their session by the peer port
//! (the client's original source port), then relayed through a
//! [`TcpTunnelPair`].

use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use super::tunnel::TcpTunnelPair;
use crate::error::{ProxyError, Result};
use crate::interceptor::tcp::TcpVirtualGateway;
use crate::protect::connect_protected_stream;
use crate::proxy::ProxyContext;
use crate::reactor::{Channel, ChannelPhase, Reactor, ReactorContext};

const LISTEN_BACKLOG: i32 = 1024;

fn bind_dual_stack() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, None)?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
    Ok(socket)
}

fn bind_ipv4() -> Result<Socket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let bind = || -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        Ok(socket)
    };
    bind().map_err(|e| ProxyError::bind(addr, e.to_string()).into())
}

/// Bind a dual-stack listener on an ephemeral port
///
/// Falls back to IPv4 only when the host has no IPv6 stack.
fn bind_listener() -> Result<std::net::TcpListener> {
    let socket = match bind_dual_stack() {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Dual-stack bind unavailable ({}), using IPv4", e);
            bind_ipv4()?
        }
    };
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// One shard: a listener plus the reactor that relays its connections
pub struct TcpProxyServer {
    index: usize,
    listener: TcpListener,
    port: u16,
    gateway: Arc<TcpVirtualGateway>,
    context: Arc<ProxyContext>,
}

impl TcpProxyServer {
    /// Bind the shard's listener
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BindError` if no listening socket can be bound.
    pub fn bind(index: usize, gateway: Arc<TcpVirtualGateway>, context: Arc<ProxyContext>) -> Result<Self> {
        let listener = bind_listener()?;
        let port = listener.local_addr()?.port();
        info!(shard = index, port, "TCP proxy shard bound");
        Ok(Self {
            index,
            listener: TcpListener::from_std(listener),
            port,
            gateway,
            context,
        })
    }

    /// Local port the NAT redirects to
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Run the shard on its own thread until the lifecycle stops
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reactor` if the thread cannot be spawned.
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        std::thread::Builder::new()
            .name(format!("tcp-shard-{}", self.index))
            .spawn(move || self.run())
            .map_err(|e| ProxyError::Reactor(format!("tcp shard thread: {e}")).into())
    }

    /// Run the shard on the current thread
    ///
    /// # Errors
    ///
    /// Returns the reactor's error.
    pub fn run(self) -> Result<()> {
        let Self {
            index,
            mut listener,
            port,
            gateway,
            context,
        } = self;
        let mut reactor = Reactor::new(format!("tcp-shard-{index}"), Arc::clone(context.lifecycle()))?;
        let token = reactor.next_token();
        reactor
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        reactor.attach(
            token,
            Rc::new(RefCell::new(Acceptor {
                listener,
                port,
                gateway,
                context,
            })),
        );
        reactor.run()
    }
}

impl std::fmt::Debug for TcpProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpProxyServer")
            .field("index", &self.index)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

struct Acceptor {
    listener: TcpListener,
    port: u16,
    gateway: Arc<TcpVirtualGateway>,
    context: Arc<ProxyContext>,
}

impl Acceptor {
    fn relay(&self, stream: mio::net::TcpStream, peer: SocketAddr, ctx: &mut ReactorContext<'_>) -> Result<()> {
        let Some(session) = self.context.tcp_sessions().query(peer.port()) else {
            warn!(port = self.port, peer = %peer, "No session for accepted connection");
            return Ok(());
        };
        let remote_addr = SocketAddr::new(session.destination_address().to_std(), session.destination_port().get());
        let remote = match connect_protected_stream(remote_addr, self.context.protector()) {
            Ok(remote) => remote,
            Err(e) => {
                self.context.report_unreachable(remote_addr, &e);
                self.context.tcp_sessions().remove(&session);
                return Ok(());
            }
        };
        debug!(session = %session, "Connecting to remote");

        let pair = TcpTunnelPair::open(
            session,
            stream,
            remote,
            remote_addr,
            Arc::clone(&self.gateway),
            Arc::clone(&self.context),
            ctx,
        )?;
        let (local_token, remote_token) = pair.tokens();
        let pair = Rc::new(RefCell::new(pair));
        ctx.attach(local_token, Rc::clone(&pair) as _);
        ctx.attach(remote_token, pair);
        Ok(())
    }
}

impl Channel for Acceptor {
    fn phase(&self, _token: Token) -> ChannelPhase {
        ChannelPhase::Listening
    }

    fn on_accept(&mut self, _token: Token, ctx: &mut ReactorContext<'_>) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let peer = SocketAddr::new(peer.ip().to_canonical(), peer.port());
                    if let Err(e) = self.relay(stream, peer, ctx) {
                        warn!(peer = %peer, "Failed to relay accepted connection: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn release(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.listener);
        debug!(port = self.port, "TCP proxy shard released");
    }
}

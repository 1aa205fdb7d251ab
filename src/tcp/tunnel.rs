//! Relayed TCP connection
//!
//! A [`TcpTunnelPair`] joins the connection accepted by a proxy shard (the
//! local half, facing the client through the NAT) with an outbound
//! connection to the real server (the remote half). Both halves are
//! registered with the shard's reactor under their own token and share this
//! one channel object.
//!
//! ```text
//! client ──NAT──► local half ──read──► TcpVirtualGateway::on_request  ──► Outbox ──► remote half ──► server
//! client ◄──NAT── local half ◄── Outbox ◄── TcpVirtualGateway::on_response ◄──read── remote half ◄── server
//! ```
//!
//! Interceptors write through the [`Outbox`], which only queues. The pair
//! flushes the queues after each chain call and keeps unwritten bytes until
//! the socket is writable again. Once a half holds [`PENDING_LIMIT`] unwritten
//! bytes, the half feeding it stops being read until it drains.
//!
//! EOF or an I/O error on either half closes both. The finished hooks of each
//! direction fire exactly once, before the sockets are released.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use crate::error::{InterceptorError, ProxyError, Result};
use crate::interceptor::tcp::TcpVirtualGateway;
use crate::interceptor::tunnel::Tunnel;
use crate::proxy::ProxyContext;
use crate::reactor::{Channel, ChannelPhase, ReactorContext};
use crate::session::Session;

const READ_CHUNK: usize = 16 * 1024;

/// Unwritten bytes a half may hold before its source is paused
pub const PENDING_LIMIT: usize = 1024 * 1024;

/// Write queues filled by interceptors during one chain call
#[derive(Debug, Default)]
pub struct Outbox {
    to_remote: RefCell<VecDeque<Bytes>>,
    to_local: RefCell<VecDeque<Bytes>>,
    closed: Cell<bool>,
}

impl Outbox {
    fn queued(&self, to_remote: bool) -> usize {
        let queue = if to_remote { &self.to_remote } else { &self.to_local };
        queue.borrow().iter().map(Bytes::len).sum()
    }

    fn take_remote(&self) -> VecDeque<Bytes> {
        self.to_remote.take()
    }

    fn take_local(&self) -> VecDeque<Bytes> {
        self.to_local.take()
    }
}

impl Tunnel for Outbox {
    fn write_to_remote_server(&self, buffer: Bytes) -> Result<()> {
        if self.closed.get() {
            return Err(ProxyError::TunnelClosed.into());
        }
        if !buffer.is_empty() {
            self.to_remote.borrow_mut().push_back(buffer);
        }
        Ok(())
    }

    fn write_to_local_client(&self, buffer: Bytes) -> Result<()> {
        if self.closed.get() {
            return Err(ProxyError::TunnelClosed.into());
        }
        if !buffer.is_empty() {
            self.to_local.borrow_mut().push_back(buffer);
        }
        Ok(())
    }
}

/// One socket of the pair with its unwritten bytes
struct Half {
    stream: TcpStream,
    token: Token,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    registered: bool,
    wants_write: bool,
    /// Reading stopped because the opposite half is backed up
    paused: bool,
}

impl Half {
    const fn new(stream: TcpStream, token: Token) -> Self {
        Self {
            stream,
            token,
            pending: VecDeque::new(),
            pending_bytes: 0,
            registered: false,
            wants_write: false,
            paused: false,
        }
    }

    fn queue(&mut self, buffers: VecDeque<Bytes>) {
        self.pending_bytes += buffers.iter().map(Bytes::len).sum::<usize>();
        self.pending.extend(buffers);
    }

    /// Write as much as the socket takes; `Ok(true)` once drained
    fn flush(&mut self) -> io::Result<bool> {
        while let Some(front) = self.pending.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    front.advance(n);
                    self.pending_bytes -= n;
                    if front.is_empty() {
                        self.pending.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Keep WRITABLE interest exactly while bytes are pending
    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        if !self.registered {
            return Ok(());
        }
        let wants_write = !self.pending.is_empty();
        if wants_write != self.wants_write {
            let interest = if wants_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(&mut self.stream, self.token, interest)?;
            self.wants_write = wants_write;
        }
        Ok(())
    }

    fn release(&mut self, registry: &Registry) {
        if self.registered {
            let _ = registry.deregister(&mut self.stream);
            self.registered = false;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Lifecycle of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    /// Outbound connect in progress; the local half is not yet read
    Connecting,
    /// Both halves relay bytes
    Relaying,
    /// Finished hooks have fired; waiting for queued bytes to drain
    Draining,
    /// Sockets released
    Closed,
}

/// A client connection relayed to its real destination
pub struct TcpTunnelPair {
    session: Arc<Session>,
    remote_addr: SocketAddr,
    gateway: Arc<TcpVirtualGateway>,
    context: Arc<ProxyContext>,
    local: Half,
    remote: Half,
    outbox: Outbox,
    state: PairState,
    request_finished: bool,
    response_finished: bool,
}

impl TcpTunnelPair {
    /// Register the outbound connect and build the pair
    ///
    /// The local half is registered once the connect completes.
    ///
    /// # Errors
    ///
    /// Returns the registry error if the remote socket cannot be registered.
    pub fn open(
        session: Arc<Session>,
        local: TcpStream,
        mut remote: TcpStream,
        remote_addr: SocketAddr,
        gateway: Arc<TcpVirtualGateway>,
        context: Arc<ProxyContext>,
        ctx: &mut ReactorContext<'_>,
    ) -> Result<Self> {
        let local_token = ctx.next_token();
        let remote_token = ctx.next_token();
        ctx.registry()
            .register(&mut remote, remote_token, Interest::WRITABLE)?;

        let mut remote = Half::new(remote, remote_token);
        remote.registered = true;
        Ok(Self {
            session,
            remote_addr,
            gateway,
            context,
            local: Half::new(local, local_token),
            remote,
            outbox: Outbox::default(),
            state: PairState::Connecting,
            request_finished: false,
            response_finished: false,
        })
    }

    /// Tokens of the local and remote halves
    #[must_use]
    pub const fn tokens(&self) -> (Token, Token) {
        (self.local.token, self.remote.token)
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn is_local(&self, token: Token) -> bool {
        token == self.local.token
    }

    /// Read everything available from one half into the chain
    ///
    /// Stops early, marking the half paused, when the half it feeds holds
    /// [`PENDING_LIMIT`] bytes. Returns `Ok(true)` when the half reached EOF.
    fn pump(&mut self, from_local: bool) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let target = if from_local { &self.remote } else { &self.local };
            if target.pending_bytes + self.outbox.queued(from_local) >= PENDING_LIMIT {
                trace!(session = %self.session, local = from_local, "Backlog full, pausing reads");
                let half = if from_local { &mut self.local } else { &mut self.remote };
                half.paused = true;
                return Ok(false);
            }
            let half = if from_local { &mut self.local } else { &mut self.remote };
            half.paused = false;
            let n = match half.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.session.touch();
            let buffer = Bytes::copy_from_slice(&chunk[..n]);
            let result = if from_local {
                self.gateway.on_request(buffer, &self.session, &self.outbox)
            } else {
                self.gateway.on_response(buffer, &self.session, &self.outbox)
            };
            if let Err(e) = result {
                if !e.is_recoverable() {
                    return Err(e);
                }
                warn!(session = %self.session, "Interceptor dropped {} bytes: {}", n, e);
            }
        }
    }

    /// Move queued outbox bytes to the sockets
    fn flush(&mut self, registry: &Registry) -> Result<()> {
        self.remote.queue(self.outbox.take_remote());
        self.local.queue(self.outbox.take_local());
        if self.state != PairState::Connecting {
            self.remote.flush()?;
        }
        self.local.flush()?;
        self.remote.update_interest(registry)?;
        self.local.update_interest(registry)?;
        Ok(())
    }

    fn drained(&self) -> bool {
        self.local.pending.is_empty() && self.remote.pending.is_empty()
    }

    /// Fire the finished hooks once per direction
    fn finish(&mut self) {
        if !self.request_finished {
            self.request_finished = true;
            if let Err(e) = self.gateway.on_request_finished(&self.session, &self.outbox) {
                warn!(session = %self.session, "Request finished hook failed: {}", e);
            }
        }
        if !self.response_finished {
            self.response_finished = true;
            if let Err(e) = self.gateway.on_response_finished(&self.session, &self.outbox) {
                warn!(session = %self.session, "Response finished hook failed: {}", e);
            }
        }
        self.outbox.closed.set(true);
    }

    /// Finish, then close once queued bytes are written
    fn close_gracefully(&mut self, ctx: &mut ReactorContext<'_>) {
        if matches!(self.state, PairState::Draining | PairState::Closed) {
            return;
        }
        self.finish();
        self.state = PairState::Draining;
        if self.flush(ctx.registry()).is_err() || self.drained() {
            self.close(ctx);
        }
    }

    /// Release both halves immediately
    fn close(&mut self, ctx: &mut ReactorContext<'_>) {
        if self.state == PairState::Closed {
            return;
        }
        self.finish();
        self.shutdown(ctx.registry());
        ctx.detach(self.local.token);
        ctx.detach(self.remote.token);
    }

    fn shutdown(&mut self, registry: &Registry) {
        self.state = PairState::Closed;
        self.local.release(registry);
        self.remote.release(registry);
        self.context.tcp_sessions().remove(&self.session);
        debug!(session = %self.session, "Tunnel pair closed");
    }
}

impl Channel for TcpTunnelPair {
    fn phase(&self, token: Token) -> ChannelPhase {
        if self.state == PairState::Connecting && token == self.remote.token {
            ChannelPhase::Connecting
        } else {
            ChannelPhase::Established
        }
    }

    fn on_connect(&mut self, _token: Token, ctx: &mut ReactorContext<'_>) -> Result<()> {
        if let Some(e) = self.remote.stream.take_error()? {
            return Err(ProxyError::connection_failed(self.remote_addr, e.to_string()).into());
        }
        match self.remote.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => return Err(ProxyError::connection_failed(self.remote_addr, e.to_string()).into()),
        }

        let registry = ctx.registry();
        registry.reregister(&mut self.remote.stream, self.remote.token, Interest::READABLE)?;
        registry.register(&mut self.local.stream, self.local.token, Interest::READABLE)?;
        self.local.registered = true;
        self.state = PairState::Relaying;
        debug!(session = %self.session, remote = %self.remote_addr, "Remote connected");

        // Anything the client sent while connecting is already buffered
        let local_eof = self.pump(true)?;
        self.flush(ctx.registry())?;
        if local_eof {
            self.close_gracefully(ctx);
        }
        Ok(())
    }

    fn on_readable(&mut self, token: Token, ctx: &mut ReactorContext<'_>) -> Result<()> {
        if self.state != PairState::Relaying {
            return Ok(());
        }
        let eof = self.pump(self.is_local(token))?;
        self.flush(ctx.registry())?;
        if eof {
            trace!(session = %self.session, local = self.is_local(token), "EOF");
            self.close_gracefully(ctx);
        }
        Ok(())
    }

    fn on_writable(&mut self, token: Token, ctx: &mut ReactorContext<'_>) -> Result<()> {
        let local = self.is_local(token);
        let half = if local { &mut self.local } else { &mut self.remote };
        half.flush()?;
        half.update_interest(ctx.registry())?;
        let below_limit = half.pending_bytes < PENDING_LIMIT;
        if self.state == PairState::Draining && self.drained() {
            self.close(ctx);
            return Ok(());
        }

        // The local half feeds the remote one and the other way round
        let source_paused = if local { self.remote.paused } else { self.local.paused };
        if self.state == PairState::Relaying && source_paused && below_limit {
            let eof = self.pump(!local)?;
            self.flush(ctx.registry())?;
            if eof {
                self.close_gracefully(ctx);
            }
        }
        Ok(())
    }

    fn on_exception(&mut self, token: Token, err: &InterceptorError, ctx: &mut ReactorContext<'_>) {
        if self.state == PairState::Connecting {
            self.context.report_unreachable(self.remote_addr, err);
        } else if err.is_recoverable() {
            debug!(session = %self.session, token = token.0, "Tunnel pair failed: {}", err);
        } else {
            warn!(session = %self.session, token = token.0, "Tunnel pair failed: {}", err);
        }
        self.close(ctx);
    }

    fn release(&mut self, registry: &Registry) {
        if self.state == PairState::Closed {
            return;
        }
        self.finish();
        self.shutdown(registry);
    }
}

impl std::fmt::Debug for TcpTunnelPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTunnelPair")
            .field("session", &self.session.key())
            .field("remote", &self.remote_addr)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_queues_until_closed() {
        let outbox = Outbox::default();
        outbox
            .write_to_remote_server(Bytes::from_static(b"a"))
            .expect("Should queue");
        outbox
            .write_to_remote_server(Bytes::new())
            .expect("Should accept empty writes");
        outbox
            .write_to_local_client(Bytes::from_static(b"b"))
            .expect("Should queue");
        assert_eq!(outbox.take_remote(), VecDeque::from([Bytes::from_static(b"a")]));
        assert_eq!(outbox.take_local(), VecDeque::from([Bytes::from_static(b"b")]));

        outbox.closed.set(true);
        let err = outbox
            .write_to_local_client(Bytes::from_static(b"c"))
            .unwrap_err();
        assert!(matches!(err, InterceptorError::Proxy(ProxyError::TunnelClosed)));
    }

    #[test]
    fn test_half_flush_writes_pending_in_order() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Should bind");
        let addr = listener.local_addr().expect("Should have address");
        let client = std::net::TcpStream::connect(addr).expect("Should connect");
        let (mut server, _) = listener.accept().expect("Should accept");
        client.set_nonblocking(true).expect("Should set nonblocking");

        let mut half = Half::new(TcpStream::from_std(client), Token(1));
        half.queue(VecDeque::from([Bytes::from_static(b"he"), Bytes::from_static(b"llo")]));
        assert_eq!(half.pending_bytes, 5);
        assert!(half.flush().expect("Should write"));
        assert_eq!(half.pending_bytes, 0);
        drop(half);

        let mut received = String::new();
        server.read_to_string(&mut received).expect("Should read");
        assert_eq!(received, "hello");
    }

    #[test]
    fn test_backlog_counts_unflushed_outbox_bytes() {
        let outbox = Outbox::default();
        outbox
            .write_to_remote_server(Bytes::from(vec![0u8; 700]))
            .expect("Should queue");
        outbox
            .write_to_remote_server(Bytes::from(vec![0u8; 300]))
            .expect("Should queue");
        outbox
            .write_to_local_client(Bytes::from(vec![0u8; 10]))
            .expect("Should queue");
        assert_eq!(outbox.queued(true), 1000);
        assert_eq!(outbox.queued(false), 10);
    }

    #[test]
    fn test_unwritable_peer_accumulates_backlog() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Should bind");
        let addr = listener.local_addr().expect("Should have address");
        let client = std::net::TcpStream::connect(addr).expect("Should connect");
        // The accepted side never reads, so the socket buffers fill up
        let (_server, _) = listener.accept().expect("Should accept");
        client.set_nonblocking(true).expect("Should set nonblocking");

        let mut half = Half::new(TcpStream::from_std(client), Token(1));
        let chunks: VecDeque<Bytes> = (0..64).map(|_| Bytes::from(vec![7u8; 256 * 1024])).collect();
        half.queue(chunks);
        assert!(!half.flush().expect("Should stop at WouldBlock"));
        assert!(half.pending_bytes > 0);
        assert_eq!(
            half.pending_bytes,
            half.pending.iter().map(Bytes::len).sum::<usize>()
        );
    }
}

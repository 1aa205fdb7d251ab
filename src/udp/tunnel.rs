//! Per-port UDP relay socket
//!
//! A [`UdpRealTunnel`] wraps one connected datagram socket towards the real
//! destination. Replies are turned back into IP frames from a
//! [`ResponseTemplate`] captured from the first client datagram, so the
//! client sees them coming from the address it originally sent to.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use crate::dispatcher::TunDevice;
use crate::error::{InterceptorError, PacketError, Result};
use crate::packet::{IpHeader, UdpHeader, UDP_HEADER_LEN};
use crate::reactor::{Channel, ReactorContext};
use crate::session::{Session, SessionStore};

/// Tunnels of one relay, by client source port
pub(crate) type TunnelMap = Rc<RefCell<HashMap<u16, Rc<RefCell<UdpRealTunnel>>>>>;

/// IP and UDP headers of a client datagram with both endpoints swapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTemplate {
    headers: Vec<u8>,
}

impl ResponseTemplate {
    /// Capture the headers of a client datagram, swapping source and
    /// destination
    ///
    /// # Errors
    ///
    /// Returns `PacketError::TooShort` if the frame has no full UDP header.
    pub fn capture(header: &IpHeader<&mut [u8]>) -> Result<Self> {
        let headers_len = header.header_len() + UDP_HEADER_LEN;
        let frame = header.as_bytes();
        if frame.len() < headers_len {
            return Err(PacketError::TooShort {
                len: frame.len(),
                min: headers_len,
            }
            .into());
        }
        let mut headers = frame[..headers_len].to_vec();
        let (source, destination) = (header.source(), header.destination());
        let mut view = IpHeader::parse(&mut headers[..])?;
        view.set_source(destination)?;
        view.set_destination(source)?;
        let header_len = view.header_len();

        let udp_bytes = &mut headers[header_len..];
        let mut udp = UdpHeader::new_unchecked(udp_bytes);
        let (client_port, remote_port) = (udp.source_port(), udp.destination_port());
        udp.set_source_port(remote_port);
        udp.set_destination_port(client_port);
        Ok(Self { headers })
    }

    /// Build a complete frame carrying `payload` to the client
    ///
    /// Lengths and checksums are recomputed.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the frame would exceed 65535 bytes.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(self.headers.len() + payload.len());
        frame.extend_from_slice(&self.headers);
        frame.extend_from_slice(payload);
        let total = u16::try_from(frame.len()).map_err(|_| PacketError::HeaderOverflow {
            header_len: self.headers.len(),
            len: frame.len(),
        })?;

        let mut header = IpHeader::parse(&mut frame[..])?;
        let header_len = header.header_len();
        header.set_total_len(total);
        header.fill_checksum();
        let pseudo = header.pseudo_header_sum();
        let udp_len = total - u16::try_from(header_len).unwrap_or(u16::MAX);
        let mut udp = UdpHeader::new_unchecked(header.payload_mut());
        udp.set_length(udp_len);
        udp.fill_checksum(pseudo);
        Ok(frame)
    }
}

/// Connected datagram socket for one client source port
pub struct UdpRealTunnel {
    session: Arc<Session>,
    socket: UdpSocket,
    token: Token,
    remote: SocketAddr,
    template: ResponseTemplate,
    tun: Arc<dyn TunDevice>,
    mtu: usize,
    pending: VecDeque<Bytes>,
    wants_write: bool,
    tunnels: TunnelMap,
    sessions: Arc<SessionStore>,
    closed: bool,
}

impl UdpRealTunnel {
    /// Register a connected socket and build the tunnel
    ///
    /// # Errors
    ///
    /// Returns the registry error.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        session: Arc<Session>,
        mut socket: UdpSocket,
        remote: SocketAddr,
        template: ResponseTemplate,
        tun: Arc<dyn TunDevice>,
        mtu: usize,
        tunnels: TunnelMap,
        sessions: Arc<SessionStore>,
        ctx: &mut ReactorContext<'_>,
    ) -> Result<Self> {
        let token = ctx.next_token();
        ctx.registry().register(&mut socket, token, Interest::READABLE)?;
        debug!(session = %session, remote = %remote, "UDP tunnel opened");
        Ok(Self {
            session,
            socket,
            token,
            remote,
            template,
            tun,
            mtu,
            pending: VecDeque::new(),
            wants_write: false,
            tunnels,
            sessions,
            closed: false,
        })
    }

    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Send one client payload to the remote
    ///
    /// # Errors
    ///
    /// Returns the socket error; the caller drops the tunnel.
    pub fn send(&mut self, payload: Bytes, registry: &Registry) -> Result<()> {
        self.session.touch();
        if !self.pending.is_empty() {
            self.pending.push_back(payload);
            return Ok(());
        }
        match self.socket.send(&payload) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.pending.push_back(payload);
                self.update_interest(registry)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_interest(&mut self, registry: &Registry) -> Result<()> {
        let wants_write = !self.pending.is_empty();
        if wants_write != self.wants_write {
            let interest = if wants_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(&mut self.socket, self.token, interest)?;
            self.wants_write = wants_write;
        }
        Ok(())
    }

    /// Deregister, drop from the relay map and forget the session
    pub(crate) fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = registry.deregister(&mut self.socket);
        let port = self.session.source_port().get();
        {
            let mut tunnels = self.tunnels.borrow_mut();
            let is_self = tunnels
                .get(&port)
                .is_some_and(|t| t.try_borrow().is_err() || t.borrow().token == self.token);
            if is_self {
                tunnels.remove(&port);
            }
        }
        self.sessions.remove(&self.session);
        debug!(session = %self.session, "UDP tunnel closed");
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Channel for UdpRealTunnel {
    fn on_readable(&mut self, _token: Token, _ctx: &mut ReactorContext<'_>) -> Result<()> {
        let mut buf = vec![0u8; self.mtu];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    self.session.touch();
                    trace!(session = %self.session, "UDP reply {} bytes", n);
                    let frame = self.template.build(&buf[..n])?;
                    self.tun.write_packet(&frame)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn on_writable(&mut self, _token: Token, ctx: &mut ReactorContext<'_>) -> Result<()> {
        while let Some(payload) = self.pending.front() {
            match self.socket.send(payload) {
                Ok(_) => {
                    self.pending.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.update_interest(ctx.registry())
    }

    fn on_exception(&mut self, token: Token, err: &InterceptorError, ctx: &mut ReactorContext<'_>) {
        warn!(session = %self.session, remote = %self.remote, "UDP tunnel failed: {}", err);
        self.close(ctx.registry());
        ctx.detach(token);
    }

    fn release(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = registry.deregister(&mut self.socket);
    }
}

impl std::fmt::Debug for UdpRealTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRealTunnel")
            .field("session", &self.session.key())
            .field("remote", &self.remote)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

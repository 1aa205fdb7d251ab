//! TCP NAT rewriting on the dispatcher path
//!
//! ```text
//! request  (client :sp -> D:dp)       becomes  D:sp      -> tun:shard_port
//! response (tun:shard_port -> D:sp)   becomes  D:dp      -> tun:sp
//! ```
//!
//! A frame whose source port is one of the shard ports comes back from a
//! proxy shard; every other frame is a client request. The shard is chosen
//! by `source port % shard count`, so one client flow always lands on the
//! same reactor.

use std::sync::Arc;

use tracing::trace;

use super::limiter::{Direction, ShapedWriter};
use crate::dispatcher::{PacketInterceptor, TunDevice};
use crate::error::{PacketError, Result, SessionError};
use crate::packet::{IpAddress, IpHeader, TcpHeader};
use crate::session::SessionStore;

/// Redirects client TCP flows to the proxy shards and restores the
/// original addressing on the way back
pub struct TcpPacketInterceptor {
    sessions: Arc<SessionStore>,
    shard_ports: Vec<u16>,
    proxy_address: IpAddress,
    ipv6_proxy_address: IpAddress,
    shaper: Option<ShapedWriter>,
}

impl TcpPacketInterceptor {
    /// # Arguments
    ///
    /// * `sessions` - TCP session store shared with the shards
    /// * `shard_ports` - Listening port of each shard, in shard order
    /// * `proxy_address` - IPv4 address of the tunnel interface
    /// * `ipv6_proxy_address` - IPv6 address of the tunnel interface
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        shard_ports: Vec<u16>,
        proxy_address: IpAddress,
        ipv6_proxy_address: IpAddress,
    ) -> Self {
        Self {
            sessions,
            shard_ports,
            proxy_address,
            ipv6_proxy_address,
            shaper: None,
        }
    }

    /// Route rewritten frames through a bandwidth shaper
    #[must_use]
    pub fn with_shaper(mut self, shaper: ShapedWriter) -> Self {
        self.shaper = Some(shaper);
        self
    }

    /// Whether `port` belongs to a proxy shard
    #[must_use]
    pub fn is_shard_port(&self, port: u16) -> bool {
        self.shard_ports.contains(&port)
    }

    const fn tunnel_address(&self, header_version: u8) -> IpAddress {
        if header_version == 6 {
            self.ipv6_proxy_address
        } else {
            self.proxy_address
        }
    }

    /// Rewrite one frame in place
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for a response without a session, or
    /// `PacketError` if the segment is truncated or no shard exists.
    pub fn rewrite(&self, header: &mut IpHeader<&mut [u8]>) -> Result<Direction> {
        let (source_port, destination_port) = {
            let tcp = TcpHeader::new_checked(header.payload()).ok_or(PacketError::TooShort {
                len: header.payload().len(),
                min: crate::packet::tcp::TCP_MIN_HEADER_LEN,
            })?;
            (tcp.source_port(), tcp.destination_port())
        };
        let source = header.source();
        let destination = header.destination();
        let tunnel = self.tunnel_address(header.version());

        let (direction, new_source_port, new_destination_port) = if self.is_shard_port(source_port) {
            let session = self.sessions.query(destination_port).ok_or(SessionError::NotFound {
                protocol: "tcp",
                port: destination_port,
            })?;
            session.touch();
            trace!(
                "[IPv{}-TCP] client {} < proxy {}",
                header.version(),
                destination_port,
                source_port
            );
            (Direction::Response, session.destination_port().get(), destination_port)
        } else {
            if self.shard_ports.is_empty() {
                return Err(PacketError::UnsupportedProtocol(header.protocol_code()).into());
            }
            self.sessions.insert(source_port, destination, destination_port);
            let shard_port = self.shard_ports[usize::from(source_port) % self.shard_ports.len()];
            trace!(
                "[IPv{}-TCP] client {} > proxy {} ({})",
                header.version(),
                source_port,
                shard_port,
                source
            );
            (Direction::Request, source_port, shard_port)
        };

        header.set_source(destination)?;
        header.set_destination(tunnel)?;
        header.fill_checksum();
        let pseudo = header.pseudo_header_sum();
        let mut tcp = TcpHeader::new_unchecked(header.payload_mut());
        tcp.set_source_port(new_source_port);
        tcp.set_destination_port(new_destination_port);
        tcp.fill_checksum(pseudo);

        Ok(direction)
    }
}

impl PacketInterceptor for TcpPacketInterceptor {
    fn intercept(&self, mut header: IpHeader<&mut [u8]>, tun: &dyn TunDevice) -> Result<()> {
        let direction = self.rewrite(&mut header)?;
        let len = header.total_len().min(header.as_bytes().len());
        let frame = &header.as_bytes()[..len];
        match &self.shaper {
            Some(shaper) => shaper.submit(direction, frame.to_vec()),
            None => tun.write_packet(frame)?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for TcpPacketInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPacketInterceptor")
            .field("shard_ports", &self.shard_ports)
            .field("shaped", &self.shaper.is_some())
            .finish_non_exhaustive()
    }
}

//! UDP pseudo-NAT on the dispatcher path
//!
//! UDP has no connection to redirect, so nothing is rewritten here. Each
//! client datagram refreshes its session, captures a reply template and is
//! handed to the relay without blocking the dispatcher.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::server::{UdpHandoff, UdpRequest};
use super::tunnel::ResponseTemplate;
use crate::dispatcher::{PacketInterceptor, TunDevice};
use crate::error::{PacketError, Result};
use crate::packet::{IpHeader, UdpHeader, UDP_HEADER_LEN};
use crate::session::SessionStore;

/// Hands client datagrams to the UDP relay
#[derive(Debug)]
pub struct UdpPacketInterceptor {
    sessions: Arc<SessionStore>,
    handoff: UdpHandoff,
}

impl UdpPacketInterceptor {
    #[must_use]
    pub const fn new(sessions: Arc<SessionStore>, handoff: UdpHandoff) -> Self {
        Self { sessions, handoff }
    }
}

impl PacketInterceptor for UdpPacketInterceptor {
    fn intercept(&self, header: IpHeader<&mut [u8]>, _tun: &dyn TunDevice) -> Result<()> {
        let udp = UdpHeader::new_checked(header.payload()).ok_or(PacketError::TooShort {
            len: header.payload().len(),
            min: UDP_HEADER_LEN,
        })?;
        let session = self
            .sessions
            .insert(udp.source_port(), header.destination(), udp.destination_port());
        let payload = Bytes::copy_from_slice(udp.payload());
        trace!(session = %session, "UDP datagram {} bytes", payload.len());

        let template = ResponseTemplate::capture(&header)?;
        self.handoff.submit(UdpRequest {
            session,
            template,
            payload,
        });
        Ok(())
    }
}

//! UDP pseudo-NAT and relay
//!
//! Datagrams are correlated purely by client source port. One reactor thread
//! owns every relay socket; replies are rebuilt into IP frames and written
//! straight to the tunnel device.

pub mod nat;
pub mod server;
pub mod tunnel;

pub use nat::UdpPacketInterceptor;
pub use server::{UdpHandoff, UdpProxyServer, UdpRequest};
pub use tunnel::{ResponseTemplate, UdpRealTunnel};

//! TCP NAT and relay
//!
//! ```text
//! dispatcher ──► TcpPacketInterceptor (rewrite) ──► [ShapedWriter] ──► tun
//!                                  │
//!                 kernel delivers rewritten SYN to shard port
//!                                  ▼
//!                TcpProxyServer (shard N, own reactor thread)
//!                                  │ accept, session lookup by peer port
//!                                  ▼
//!                TcpTunnelPair ◄──► real server (protected socket)
//! ```

pub mod limiter;
pub mod nat;
pub mod server;
pub mod tunnel;

pub use limiter::{BandwidthLimiter, Direction, ShapedWriter};
pub use nat::TcpPacketInterceptor;
pub use server::TcpProxyServer;
pub use tunnel::{Outbox, TcpTunnelPair};

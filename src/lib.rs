//! tun-interceptor: on-device transparent traffic interception
//!
//! This crate sits behind a virtual network interface (a TUN device) and
//! turns the raw IP frames read from it back into TCP and UDP flows that can
//! be observed, decrypted and rewritten before they reach the real network.
//!
//! # Features
//!
//! - **Packet codec**: zero-copy IPv4/IPv6/TCP/UDP header views with in-place
//!   checksum recomputation
//! - **TCP NAT**: client flows redirected to sharded local proxy servers, each
//!   driven by its own `mio` reactor
//! - **UDP pseudo-NAT**: per-source-port relay sockets with synthesized reply
//!   frames
//! - **TLS interception**: ClientHello sniffing, SNI extraction and streaming
//!   decrypt/re-encrypt through a pluggable engine (`rustls` provided)
//! - **Interceptor chains**: TCP byte-level and HTTP request/response chains,
//!   indexed variants and an offloaded async chain on `tokio`
//!
//! # Architecture
//!
//! ```text
//! client app ─► TUN ─► PacketDispatcher ─► TCP NAT ─► TcpProxyServer ─► remote
//!                           │                              │
//!                           │                      interceptor chains
//!                           └────────► UDP NAT ─► UdpProxyServer ─► remote
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_interceptor::config::load_config;
//! use tun_interceptor::dispatcher::{FdTunDevice, TunDevice};
//! use tun_interceptor::proxy::InterceptionProxy;
//!
//! # fn example(fd: std::os::fd::OwnedFd) -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-interceptor/config.json")?;
//! tun_interceptor::logging::init_logging(&config.log);
//!
//! let tun: Arc<dyn TunDevice> = Arc::new(FdTunDevice::new(fd));
//! let handle = InterceptionProxy::new(config).start(tun)?;
//! // ...
//! handle.stop();
//! handle.join()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`dispatcher`]: Tunnel read loop and per-protocol routing
//! - [`error`]: Error types
//! - [`event`]: Important events for the host
//! - [`interceptor`]: TCP and HTTP interceptor chains
//! - [`packet`]: IP, TCP and UDP header codec
//! - [`proxy`]: Proxy assembly and lifecycle
//! - [`reactor`]: Readiness loop shared by the relays
//! - [`session`]: NAT session tables
//! - [`tcp`]: TCP NAT, proxy shards and tunnel pairs
//! - [`tls`]: TLS sniffing and interception codec
//! - [`udp`]: UDP pseudo-NAT and relay

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod interceptor;
pub mod logging;
pub mod packet;
pub mod protect;
pub mod proxy;
pub mod reactor;
pub mod session;
pub mod tcp;
pub mod tls;
pub mod udp;

// Re-export commonly used types at the crate root
pub use config::{load_config, ProxyConfig};
pub use dispatcher::{FdTunDevice, PacketDispatcher, TunDevice};
pub use error::{ConfigError, InterceptorError, PacketError, ProxyError, Result, SessionError, TlsError};
pub use event::{EventListener, EventSynopsis, ImportantEvent};
pub use interceptor::{HttpInterceptor, HttpSession, TcpInterceptor, Tunnel};
pub use packet::{IpAddress, IpHeader, Port, Protocol};
pub use protect::{NoOpSocketProtector, OutboundSocket, SocketProtector};
pub use proxy::{InterceptionProxy, ProxyContext, ProxyHandle};
pub use session::{Session, SessionStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

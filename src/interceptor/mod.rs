//! Interceptor chains
//!
//! Relayed bytes pass through two nested chains. The TCP chain sees every
//! chunk of every connection; its last entry is the HTTP bridge, which runs
//! the HTTP chain over the same bytes with TLS sniffing, decryption and
//! header parsing around the user's HTTP interceptors.
//!
//! ```text
//! TcpTunnelPair ─► TcpVirtualGateway ─► [user TCP interceptors] ─► HttpTcpInterceptor
//!                                                                     │
//!                                         HttpVirtualGateway ◄────────┘
//!                                           sniff ─► decrypt ─► [user HTTP] ─► parse ─► async ─► flush
//! ```

pub mod chain;
pub mod http;
pub mod ssl;
pub mod tcp;
pub mod tunnel;

pub use chain::InterceptChain;
pub use http::{
    AsyncHttpInterceptor, AsyncHttpInterceptorFactory, HttpInterceptor, HttpInterceptorFactory, HttpSession,
    HttpTcpInterceptor, HttpVirtualGateway,
};
pub use ssl::{HttpSslCodecInterceptor, HttpSslSniffInterceptor};
pub use tcp::{TcpForwardInterceptor, TcpInterceptChain, TcpInterceptor, TcpInterceptorFactory, TcpVirtualGateway};
pub use tunnel::Tunnel;

//! TLS interception
//!
//! The proxy terminates TLS on both sides of an intercepted connection so
//! that HTTP interceptors see plaintext:
//!
//! - [`predicate`]: first-buffer classification (HTTP vs TLS) and host hints
//!   (SNI, `Host` header)
//! - [`record`]: record completeness check and pending-chunk reassembly
//! - [`engine`]: engine traits and the rustls-backed factory
//! - [`codec`]: per-session engine tables with callback delivery

pub mod codec;
pub mod engine;
pub mod predicate;
pub mod record;

pub use codec::{CodecCallback, TlsCodec, TlsRole};
pub use engine::{
    CertificateAuthority, CodecOutput, RustlsEngine, RustlsEngineFactory, StaticCertificate, TlsEngine,
    TlsEngineFactory,
};
pub use predicate::{parse_http_host, parse_sni, sniff_https};
pub use record::{verify_packet, PendingQueue, VerifyResult};

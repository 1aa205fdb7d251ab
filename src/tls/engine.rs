//! TLS engines terminating each side of an intercepted connection
//!
//! The proxy stands between the local client and the real server and runs
//! two independent TLS sessions per intercepted connection:
//!
//! ```text
//! local client ──TLS──► [server-role engine] proxy [client-role engine] ──TLS──► real server
//! ```
//!
//! Engines are synchronous record processors: ciphertext in, plaintext out
//! and the other way round. They never touch sockets.
//!
//! [`RustlsEngineFactory`] is the bundled implementation. Certificates for
//! the server role come from a host-supplied [`CertificateAuthority`];
//! issuing them is outside this crate.

use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use tracing::{debug, trace, warn};

use crate::error::TlsError;

/// Bytes produced by one engine call
#[derive(Debug, Default)]
pub struct CodecOutput {
    /// Decrypted application data
    pub plaintext: Vec<u8>,
    /// Records to send to the peer (handshake messages, alerts, encrypted
    /// application data)
    pub ciphertext: Vec<u8>,
}

impl CodecOutput {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plaintext.is_empty() && self.ciphertext.is_empty()
    }
}

/// One side of a TLS session
pub trait TlsEngine: Send {
    /// Feed records received from the peer
    ///
    /// # Errors
    ///
    /// Returns `TlsError::Protocol` if the peer violates the protocol. Alerts
    /// queued for the peer are still written to `out`.
    fn decode(&mut self, ciphertext: &[u8], out: &mut CodecOutput) -> Result<(), TlsError>;

    /// Encrypt application data for the peer
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has failed or is closed.
    fn encode(&mut self, plaintext: &[u8], out: &mut CodecOutput) -> Result<(), TlsError>;

    /// Emit the opening flight (a `ClientHello` for the client role)
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has failed.
    fn handshake(&mut self, out: &mut CodecOutput) -> Result<(), TlsError>;

    fn is_handshaking(&self) -> bool;
}

/// Creates engines for intercepted sessions
///
/// Creation failure returns `None`; the caller logs it and drops the buffer.
pub trait TlsEngineFactory: Send + Sync {
    /// Engine facing the local client, presenting a certificate for `host`
    fn create_server_engine(&self, host: &str) -> Option<Box<dyn TlsEngine>>;

    /// Engine facing the real server at `host:port`
    fn create_client_engine(&self, host: &str, port: u16) -> Option<Box<dyn TlsEngine>>;
}

/// Source of per-host certificates for the server role
pub trait CertificateAuthority: Send + Sync {
    /// Certificate chain and signing key presented for `host`
    fn certified_key(&self, host: &str) -> Option<Arc<CertifiedKey>>;
}

/// One certificate presented for every host
#[derive(Debug, Clone)]
pub struct StaticCertificate {
    key: Arc<CertifiedKey>,
}

impl StaticCertificate {
    /// Build from a DER certificate chain and private key
    ///
    /// # Errors
    ///
    /// Returns `TlsError::Protocol` if the key type is not supported.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: &PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        ensure_crypto_provider();
        let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
            .map_err(|e| TlsError::protocol(e.to_string()))?;
        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}

impl CertificateAuthority for StaticCertificate {
    fn certified_key(&self, _host: &str) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

/// Install the ring provider as process default (only once)
pub fn ensure_crypto_provider() {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug)]
struct HostCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Hosts whose server configuration is kept for reuse
pub const MAX_CACHED_HOSTS: usize = 512;

/// Engine factory backed by rustls
///
/// Server configurations are cached per host up to [`MAX_CACHED_HOSTS`];
/// past that an arbitrary entry is evicted for each new host.
pub struct RustlsEngineFactory {
    authority: Arc<dyn CertificateAuthority>,
    client_config: Arc<ClientConfig>,
    server_configs: DashMap<String, Arc<ServerConfig>>,
}

impl RustlsEngineFactory {
    /// # Arguments
    ///
    /// * `authority` - Issues the certificates shown to local clients
    /// * `client_config` - Used for every connection to a real server
    #[must_use]
    pub fn new(authority: Arc<dyn CertificateAuthority>, client_config: Arc<ClientConfig>) -> Self {
        ensure_crypto_provider();
        Self {
            authority,
            client_config,
            server_configs: DashMap::new(),
        }
    }

    fn server_config(&self, host: &str) -> Option<Arc<ServerConfig>> {
        if let Some(config) = self.server_configs.get(host) {
            return Some(Arc::clone(config.value()));
        }
        let key = self.authority.certified_key(host)?;
        let config = Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(HostCertResolver(key))),
        );
        if self.server_configs.len() >= MAX_CACHED_HOSTS {
            let victim = self.server_configs.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                trace!("Evicting cached server config for {}", victim);
                self.server_configs.remove(&victim);
            }
        }
        self.server_configs
            .insert(host.to_owned(), Arc::clone(&config));
        Some(config)
    }

    /// Number of hosts with a cached server configuration
    #[must_use]
    pub fn cached_hosts(&self) -> usize {
        self.server_configs.len()
    }
}

impl std::fmt::Debug for RustlsEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngineFactory")
            .field("cached_hosts", &self.server_configs.len())
            .finish_non_exhaustive()
    }
}

impl TlsEngineFactory for RustlsEngineFactory {
    fn create_server_engine(&self, host: &str) -> Option<Box<dyn TlsEngine>> {
        let Some(config) = self.server_config(host) else {
            warn!("No certificate issued for {}", host);
            return None;
        };
        match ServerConnection::new(config) {
            Ok(conn) => Some(Box::new(RustlsEngine::new(conn.into()))),
            Err(e) => {
                warn!("Failed to create server TLS engine for {}: {}", host, e);
                None
            }
        }
    }

    fn create_client_engine(&self, host: &str, port: u16) -> Option<Box<dyn TlsEngine>> {
        let server_name = match ServerName::try_from(host.to_owned()) {
            Ok(name) => name,
            Err(e) => {
                warn!("Invalid server name {}: {}", host, e);
                return None;
            }
        };
        match ClientConnection::new(Arc::clone(&self.client_config), server_name) {
            Ok(conn) => {
                debug!("Client TLS engine created for {}:{}", host, port);
                Some(Box::new(RustlsEngine::new(conn.into())))
            }
            Err(e) => {
                warn!("Failed to create client TLS engine for {}:{}: {}", host, port, e);
                None
            }
        }
    }
}

/// [`TlsEngine`] over a rustls connection of either role
pub struct RustlsEngine {
    conn: Connection,
}

impl RustlsEngine {
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    fn drain_plaintext(&mut self, len: usize, out: &mut CodecOutput) -> Result<(), TlsError> {
        if len == 0 {
            return Ok(());
        }
        let start = out.plaintext.len();
        out.plaintext.resize(start + len, 0);
        self.conn.reader().read_exact(&mut out.plaintext[start..])?;
        Ok(())
    }

    fn flush_records(&mut self, out: &mut CodecOutput) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out.ciphertext)?;
        }
        Ok(())
    }
}

impl TlsEngine for RustlsEngine {
    fn decode(&mut self, ciphertext: &[u8], out: &mut CodecOutput) -> Result<(), TlsError> {
        let mut input = ciphertext;
        while !input.is_empty() {
            if self.conn.read_tls(&mut input)? == 0 {
                break;
            }
            match self.conn.process_new_packets() {
                Ok(state) => self.drain_plaintext(state.plaintext_bytes_to_read(), out)?,
                Err(e) => {
                    // The alert describing the failure still goes to the peer
                    self.flush_records(out)?;
                    return Err(TlsError::protocol(e.to_string()));
                }
            }
        }
        self.flush_records(out)
    }

    fn encode(&mut self, plaintext: &[u8], out: &mut CodecOutput) -> Result<(), TlsError> {
        self.conn.writer().write_all(plaintext)?;
        self.flush_records(out)
    }

    fn handshake(&mut self, out: &mut CodecOutput) -> Result<(), TlsError> {
        self.flush_records(out)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

//! Per-session TLS codec
//!
//! A codec owns the engines of one role for every session of a proxy shard.
//! The request codec terminates the local client's TLS (server role); the
//! response codec talks TLS to the real server (client role).
//!
//! Results are delivered through a [`CodecCallback`] after the engine table
//! lock is released, so callbacks may call back into any codec.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::engine::{CodecOutput, TlsEngine, TlsEngineFactory};
use super::record::{verify_packet, VerifyResult};
use crate::error::{Result, TlsError};
use crate::session::SessionKey;

/// Which end of the TLS session the proxy plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Facing the local client
    Server,
    /// Facing the real remote server
    Client,
}

impl TlsRole {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// Receives the outcome of a codec call
///
/// Every method defaults to ignoring its buffer.
pub trait CodecCallback {
    /// The record is incomplete; queue the buffer and retry with more bytes
    ///
    /// # Errors
    ///
    /// Propagated to the codec caller.
    fn should_pending(&mut self, _buffer: Bytes) -> Result<()> {
        Ok(())
    }

    /// No engine could be created for the session
    ///
    /// # Errors
    ///
    /// Propagated to the codec caller.
    fn tls_failed(&mut self, _buffer: Bytes) -> Result<()> {
        Ok(())
    }

    /// Plaintext is available (decrypted, or never encrypted)
    ///
    /// # Errors
    ///
    /// Propagated to the codec caller.
    fn decrypt_success(&mut self, _buffer: Bytes) -> Result<()> {
        Ok(())
    }

    /// Records must be sent to the engine's peer
    ///
    /// # Errors
    ///
    /// Propagated to the codec caller.
    fn encrypt_success(&mut self, _buffer: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Engines of one role, keyed by session
pub struct TlsCodec {
    role: TlsRole,
    factory: Arc<dyn TlsEngineFactory>,
    engines: Mutex<HashMap<SessionKey, Box<dyn TlsEngine>>>,
}

impl TlsCodec {
    #[must_use]
    pub fn new(role: TlsRole, factory: Arc<dyn TlsEngineFactory>) -> Self {
        Self {
            role,
            factory,
            engines: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn role(&self) -> TlsRole {
        self.role
    }

    fn create_engine(&self, key: SessionKey, host: &str) -> Option<Box<dyn TlsEngine>> {
        let engine = match self.role {
            TlsRole::Server => self.factory.create_server_engine(host),
            TlsRole::Client => self
                .factory
                .create_client_engine(host, key.destination_port.get()),
        };
        if engine.is_some() {
            debug!("Created {} TLS engine for {} ({})", self.role.name(), host, key);
        }
        engine
    }

    /// Run `f` on the session's engine, creating it if needed
    ///
    /// Returns `None` if the engine could not be created.
    fn with_engine<R>(
        &self,
        key: SessionKey,
        host: &str,
        f: impl FnOnce(&mut dyn TlsEngine) -> R,
    ) -> Option<R> {
        let mut engines = self.engines.lock();
        if !engines.contains_key(&key) {
            let engine = self.create_engine(key, host)?;
            engines.insert(key, engine);
        }
        engines.get_mut(&key).map(|engine| f(engine.as_mut()))
    }

    /// Decrypt a buffer received from this codec's peer
    ///
    /// # Errors
    ///
    /// Returns `TlsError::Protocol` when the engine rejects the records, or
    /// any error raised by `callback`.
    pub fn decode(
        &self,
        key: SessionKey,
        host: &str,
        buffer: Bytes,
        callback: &mut dyn CodecCallback,
    ) -> Result<()> {
        match verify_packet(&buffer) {
            VerifyResult::NotEncrypted => callback.decrypt_success(buffer),
            VerifyResult::NotEnough => {
                trace!("Partial TLS record ({} bytes) for {}", buffer.len(), key);
                callback.should_pending(buffer)
            }
            VerifyResult::Ready => {
                let mut out = CodecOutput::default();
                match self.with_engine(key, host, |engine| engine.decode(&buffer, &mut out)) {
                    None => callback.tls_failed(buffer),
                    Some(result) => {
                        // Alerts produced before the failure still reach the peer
                        Self::deliver(out, callback)?;
                        result.map_err(Into::into)
                    }
                }
            }
        }
    }

    /// Encrypt plaintext for this codec's peer
    ///
    /// # Errors
    ///
    /// Returns `TlsError::EngineMissing` if the session has no engine yet.
    pub fn encode(&self, key: SessionKey, buffer: &[u8], callback: &mut dyn CodecCallback) -> Result<()> {
        let mut out = CodecOutput::default();
        {
            let mut engines = self.engines.lock();
            let engine = engines
                .get_mut(&key)
                .ok_or_else(|| TlsError::EngineMissing(key.to_string()))?;
            engine.encode(buffer, &mut out)?;
        }
        Self::deliver(out, callback)
    }

    /// Start the handshake towards the real server the first time a session
    /// is seen
    ///
    /// Only the client role initiates; on a server-role codec this does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Propagates engine and callback errors.
    pub fn handshake_if_necessary(
        &self,
        key: SessionKey,
        host: &str,
        callback: &mut dyn CodecCallback,
    ) -> Result<()> {
        if self.role != TlsRole::Client || self.engines.lock().contains_key(&key) {
            return Ok(());
        }
        let mut out = CodecOutput::default();
        match self.with_engine(key, host, |engine| engine.handshake(&mut out)) {
            Some(result) => {
                result?;
                Self::deliver(out, callback)
            }
            None => {
                debug!("No client TLS engine for {} ({})", host, key);
                Ok(())
            }
        }
    }

    /// Whether the session already has an engine
    #[must_use]
    pub fn has_engine(&self, key: SessionKey) -> bool {
        self.engines.lock().contains_key(&key)
    }

    /// Drop the session's engine
    pub fn release(&self, key: SessionKey) {
        if self.engines.lock().remove(&key).is_some() {
            trace!("Released {} TLS engine for {}", self.role.name(), key);
        }
    }

    /// Number of sessions with an engine
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }

    fn deliver(out: CodecOutput, callback: &mut dyn CodecCallback) -> Result<()> {
        if !out.ciphertext.is_empty() {
            callback.encrypt_success(Bytes::from(out.ciphertext))?;
        }
        if !out.plaintext.is_empty() {
            callback.decrypt_success(Bytes::from(out.plaintext))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TlsCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCodec")
            .field("role", &self.role)
            .field("engines", &self.engines.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IpAddress;
    use crate::tls::engine::tests::self_signed_factory;

    #[derive(Default)]
    struct Collect {
        pending: Vec<Bytes>,
        failed: usize,
        plaintext: Vec<u8>,
        ciphertext: Vec<u8>,
    }

    impl CodecCallback for Collect {
        fn should_pending(&mut self, buffer: Bytes) -> Result<()> {
            self.pending.push(buffer);
            Ok(())
        }

        fn tls_failed(&mut self, _buffer: Bytes) -> Result<()> {
            self.failed += 1;
            Ok(())
        }

        fn decrypt_success(&mut self, buffer: Bytes) -> Result<()> {
            self.plaintext.extend_from_slice(&buffer);
            Ok(())
        }

        fn encrypt_success(&mut self, buffer: Bytes) -> Result<()> {
            self.ciphertext.extend_from_slice(&buffer);
            Ok(())
        }
    }

    struct NoEngines;

    impl TlsEngineFactory for NoEngines {
        fn create_server_engine(&self, _host: &str) -> Option<Box<dyn TlsEngine>> {
            None
        }

        fn create_client_engine(&self, _host: &str, _port: u16) -> Option<Box<dyn TlsEngine>> {
            None
        }
    }

    fn key() -> SessionKey {
        SessionKey::new(43000, IpAddress::V4(0x7F00_0001), 443)
    }

    #[test]
    fn test_plaintext_passes_through() {
        let codec = TlsCodec::new(TlsRole::Server, Arc::new(NoEngines));
        let mut cb = Collect::default();
        codec
            .decode(key(), "h", Bytes::from_static(b"GET / HTTP/1.1\r\n"), &mut cb)
            .expect("Should decode");
        assert_eq!(cb.plaintext, b"GET / HTTP/1.1\r\n");
        assert!(codec.is_empty());
    }

    #[test]
    fn test_partial_record_pends() {
        let codec = TlsCodec::new(TlsRole::Server, Arc::new(NoEngines));
        let mut cb = Collect::default();
        codec
            .decode(key(), "h", Bytes::from_static(&[0x16, 0x03, 0x01, 0x01, 0x00, 0x01]), &mut cb)
            .expect("Should decode");
        assert_eq!(cb.pending.len(), 1);
        assert_eq!(cb.failed, 0);
    }

    #[test]
    fn test_engine_creation_failure_reports() {
        let codec = TlsCodec::new(TlsRole::Server, Arc::new(NoEngines));
        let mut cb = Collect::default();
        codec
            .decode(key(), "h", Bytes::from_static(&[0x16, 0x03, 0x01, 0x00, 0x01, 0x01]), &mut cb)
            .expect("Should decode");
        assert_eq!(cb.failed, 1);
        assert!(cb.plaintext.is_empty());
    }

    #[test]
    fn test_encode_without_engine_fails() {
        let codec = TlsCodec::new(TlsRole::Client, Arc::new(NoEngines));
        let err = codec
            .encode(key(), b"data", &mut Collect::default())
            .expect_err("Should require an engine");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_handshake_only_for_client_role() {
        let factory: Arc<dyn TlsEngineFactory> = Arc::new(self_signed_factory(&["codec.test"]));
        let server = TlsCodec::new(TlsRole::Server, Arc::clone(&factory));
        let client = TlsCodec::new(TlsRole::Client, factory);

        let mut cb = Collect::default();
        server
            .handshake_if_necessary(key(), "codec.test", &mut cb)
            .expect("Should be a no-op");
        assert!(cb.ciphertext.is_empty());
        assert!(!server.has_engine(key()));

        client
            .handshake_if_necessary(key(), "codec.test", &mut cb)
            .expect("Should start handshake");
        let hello_len = cb.ciphertext.len();
        assert!(hello_len > 0);
        assert!(client.has_engine(key()));

        client
            .handshake_if_necessary(key(), "codec.test", &mut cb)
            .expect("Should be a no-op");
        assert_eq!(cb.ciphertext.len(), hello_len);

        client.release(key());
        assert!(client.is_empty());
    }

    #[test]
    fn test_man_in_the_middle_round_trip() {
        let factory: Arc<dyn TlsEngineFactory> = Arc::new(self_signed_factory(&["mitm.test"]));
        // The proxy's server-role codec, fed by a real client engine
        let proxy = TlsCodec::new(TlsRole::Server, Arc::clone(&factory));
        let mut client = factory
            .create_client_engine("mitm.test", 443)
            .expect("Should create client engine");

        let mut out = CodecOutput::default();
        client.handshake(&mut out).expect("Should start handshake");
        let mut to_proxy = Bytes::from(out.ciphertext);

        for _ in 0..10 {
            if to_proxy.is_empty() {
                break;
            }
            let mut cb = Collect::default();
            proxy
                .decode(key(), "mitm.test", to_proxy, &mut cb)
                .expect("Should decode on proxy");
            let mut out = CodecOutput::default();
            client.decode(&cb.ciphertext, &mut out).expect("Should decode on client");
            to_proxy = Bytes::from(out.ciphertext);
        }
        assert!(!client.is_handshaking());

        let mut out = CodecOutput::default();
        client.encode(b"secret request", &mut out).expect("Should encode");
        let mut cb = Collect::default();
        proxy
            .decode(key(), "mitm.test", Bytes::from(out.ciphertext), &mut cb)
            .expect("Should decrypt");
        assert_eq!(cb.plaintext, b"secret request");

        let mut cb = Collect::default();
        proxy.encode(key(), b"secret response", &mut cb).expect("Should encrypt");
        let mut out = CodecOutput::default();
        client.decode(&cb.ciphertext, &mut out).expect("Should decode on client");
        assert_eq!(out.plaintext, b"secret response");
    }
}

//! TLS detection and decryption stages of the HTTP chain
//!
//! [`HttpSslSniffInterceptor`] classifies each session from its first
//! request buffer. [`HttpSslCodecInterceptor`] then decrypts TLS sessions so
//! that later interceptors see plaintext; the flush stage re-encrypts.
//!
//! ```text
//! client ciphertext ─► pending queue ─► request codec (server role) ─► plaintext ─► chain
//!                                            │ handshake records
//!                                            ▼
//!                                       local client
//!
//! first request also triggers: response codec (client role) ─► ClientHello ─► real server
//! ```
//!
//! Both engines need a host name. It comes from the SNI of the client's
//! ClientHello; when the first read holds only part of that record, the
//! codec queues bytes until the whole record is there. A ClientHello without
//! SNI falls back to the session's destination address.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::http::indexed::{HttpIndexedInterceptor, Indexed};
use super::http::{HttpInterceptChain, HttpInterceptor, HttpSession};
use super::tunnel::Tunnel;
use crate::error::Result;
use crate::session::SessionKey;
use crate::tls::predicate::{host_hint, parse_sni, sniff_https};
use crate::tls::{verify_packet, CodecCallback, PendingQueue, TlsCodec, VerifyResult};

/// Sets the https, plaintext and host-hint fields on the first buffer of
/// each direction
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpSslSniffInterceptor;

impl HttpSslSniffInterceptor {
    /// The sniffer wrapped with its per-session call counter
    #[must_use]
    pub fn indexed() -> Arc<dyn HttpInterceptor> {
        Arc::new(Indexed::new(Self))
    }
}

impl HttpIndexedInterceptor for HttpSslSniffInterceptor {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
        index: usize,
    ) -> Result<()> {
        if index == 0 {
            let is_https = sniff_https(&buffer);
            let mut request = session.request();
            request.is_https = is_https;
            request.is_plaintext = Some(is_https == Some(false));
            request.host_hint = host_hint(is_https, &buffer);
            debug!(
                "Sniffed {} as {} (host {:?})",
                session.key(),
                match is_https {
                    Some(true) => "tls",
                    Some(false) => "http",
                    None => "opaque",
                },
                request.host_hint
            );
        }
        chain.process_request_next(buffer, session, tunnel)
    }

    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
        index: usize,
    ) -> Result<()> {
        if index == 0 {
            let (is_https, hint) = {
                let request = session.request();
                (request.is_https, request.host_hint.clone())
            };
            let mut response = session.response();
            response.is_https = is_https;
            response.is_plaintext = Some(is_https == Some(false));
            response.host_hint = hint;
        }
        chain.process_response_next(buffer, session, tunnel)
    }
}

/// Decrypts TLS sessions in both directions
pub struct HttpSslCodecInterceptor {
    request_codec: Arc<TlsCodec>,
    response_codec: Arc<TlsCodec>,
    pending_requests: DashMap<SessionKey, PendingQueue>,
    pending_responses: DashMap<SessionKey, PendingQueue>,
}

impl HttpSslCodecInterceptor {
    /// # Arguments
    ///
    /// * `request_codec` - Server-role codec facing the local client
    /// * `response_codec` - Client-role codec facing the real server
    #[must_use]
    pub fn new(request_codec: Arc<TlsCodec>, response_codec: Arc<TlsCodec>) -> Self {
        Self {
            request_codec,
            response_codec,
            pending_requests: DashMap::new(),
            pending_responses: DashMap::new(),
        }
    }

    /// Queue `buffer` behind earlier partial records and merge the lot
    fn merge_pending(queues: &DashMap<SessionKey, PendingQueue>, key: SessionKey, buffer: Bytes) -> Bytes {
        let mut queue = queues.entry(key).or_default();
        queue.push(buffer);
        queue.take_merged()
    }

    /// Host name for the session's engines, recorded on both records
    ///
    /// `hello` must hold the complete first handshake record.
    fn resolve_host(session: &HttpSession, hello: &[u8]) -> String {
        let host = parse_sni(hello).unwrap_or_else(|| {
            let destination = session.tcp_session().destination_address().to_string();
            debug!("No SNI from {}, using destination {}", session.key(), destination);
            destination
        });
        session.request().host_hint = Some(host.clone());
        session.response().host_hint = Some(host.clone());
        host
    }

    /// Sessions with queued partial records (both directions)
    #[must_use]
    pub fn pending_sessions(&self) -> usize {
        self.pending_requests.len() + self.pending_responses.len()
    }
}

impl std::fmt::Debug for HttpSslCodecInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSslCodecInterceptor")
            .field("request_codec", &self.request_codec)
            .field("response_codec", &self.response_codec)
            .finish_non_exhaustive()
    }
}

/// Writes handshake records towards the real server
struct RemoteSink<'t>(&'t dyn Tunnel);

impl CodecCallback for RemoteSink<'_> {
    fn encrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.0.write_to_remote_server(buffer)
    }
}

struct RequestDecode<'c, 'a, 's> {
    chain: &'c mut HttpInterceptChain<'a>,
    session: &'s Arc<HttpSession>,
    tunnel: &'s dyn Tunnel,
    pending: &'s DashMap<SessionKey, PendingQueue>,
}

impl CodecCallback for RequestDecode<'_, '_, '_> {
    fn should_pending(&mut self, buffer: Bytes) -> Result<()> {
        self.pending.entry(self.session.key()).or_default().push(buffer);
        Ok(())
    }

    fn tls_failed(&mut self, buffer: Bytes) -> Result<()> {
        warn!(
            "Request TLS engine creation failed for {}, dropping {} bytes",
            self.session.key(),
            buffer.len()
        );
        Ok(())
    }

    fn decrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.session.request().is_plaintext = Some(true);
        self.chain.process_request_next(buffer, self.session, self.tunnel)
    }

    fn encrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.tunnel.write_to_local_client(buffer)
    }
}

struct ResponseDecode<'c, 'a, 's> {
    chain: &'c mut HttpInterceptChain<'a>,
    session: &'s Arc<HttpSession>,
    tunnel: &'s dyn Tunnel,
    pending: &'s DashMap<SessionKey, PendingQueue>,
}

impl CodecCallback for ResponseDecode<'_, '_, '_> {
    fn should_pending(&mut self, buffer: Bytes) -> Result<()> {
        self.pending.entry(self.session.key()).or_default().push(buffer);
        Ok(())
    }

    fn tls_failed(&mut self, buffer: Bytes) -> Result<()> {
        warn!(
            "Response TLS engine creation failed for {}, dropping {} bytes",
            self.session.key(),
            buffer.len()
        );
        Ok(())
    }

    fn decrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.session.response().is_plaintext = Some(true);
        self.chain.process_response_next(buffer, self.session, self.tunnel)
    }

    fn encrypt_success(&mut self, buffer: Bytes) -> Result<()> {
        self.tunnel.write_to_remote_server(buffer)
    }
}

impl HttpInterceptor for HttpSslCodecInterceptor {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let (is_https, hint) = {
            let request = session.request();
            (request.is_https, request.host_hint.clone())
        };
        if is_https != Some(true) {
            return chain.process_request_next(buffer, session, tunnel);
        }
        let key = session.key();
        let (host, buffer) = match hint {
            Some(host) => (host, buffer),
            None => {
                let merged = Self::merge_pending(&self.pending_requests, key, buffer);
                if verify_packet(&merged) == VerifyResult::NotEnough {
                    trace!("Partial ClientHello ({} bytes) for {}", merged.len(), key);
                    self.pending_requests.entry(key).or_default().push(merged);
                    return Ok(());
                }
                (Self::resolve_host(session, &merged), merged)
            }
        };

        self.response_codec
            .handshake_if_necessary(key, &host, &mut RemoteSink(tunnel))?;

        let merged = Self::merge_pending(&self.pending_requests, key, buffer);
        let mut callback = RequestDecode {
            chain,
            session,
            tunnel,
            pending: &self.pending_requests,
        };
        self.request_codec.decode(key, &host, merged, &mut callback)
    }

    fn on_request_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let result = chain.process_request_finished_next(session, tunnel);
        let key = session.key();
        self.pending_requests.remove(&key);
        self.request_codec.release(key);
        result
    }

    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let (is_https, hint) = {
            let response = session.response();
            (response.is_https, response.host_hint.clone())
        };
        if is_https != Some(true) {
            return chain.process_response_next(buffer, session, tunnel);
        }
        let host = match hint.or_else(|| session.request().host_hint.clone()) {
            Some(host) => host,
            None => session.tcp_session().destination_address().to_string(),
        };
        let key = session.key();

        let merged = Self::merge_pending(&self.pending_responses, key, buffer);
        let mut callback = ResponseDecode {
            chain,
            session,
            tunnel,
            pending: &self.pending_responses,
        };
        self.response_codec.decode(key, &host, merged, &mut callback)
    }

    fn on_response_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let result = chain.process_response_finished_next(session, tunnel);
        let key = session.key();
        self.pending_responses.remove(&key);
        self.response_codec.release(key);
        result
    }
}

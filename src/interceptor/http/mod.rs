//! HTTP interceptor chain
//!
//! The HTTP chain runs inside the TCP chain through [`HttpTcpInterceptor`].
//! Every relayed connection is treated as a potential HTTP(S) exchange; the
//! built-in stages decide whether it actually is one.
//!
//! ```text
//! TcpVirtualGateway
//!   ... user TCP interceptors
//!   HttpTcpInterceptor ──► HttpVirtualGateway
//!                            1. SSL sniff (indexed)
//!                            2. SSL codec (decrypt)       only with a TLS engine factory
//!                            3. user HTTP interceptors
//!                            4. header parser (indexed)
//!                            5. async stage               only with async interceptors
//!                            6. flush (re-encrypt, write) always last
//! ```
//!
//! A user interceptor that does not forward drops the buffer: nothing after
//! it runs, including the flush stage.

pub mod async_chain;
pub mod bridge;
pub mod flush;
pub mod indexed;
pub mod parser;
pub mod session;

use std::sync::Arc;

use bytes::Bytes;

use super::chain::InterceptChain;
use super::ssl::{HttpSslCodecInterceptor, HttpSslSniffInterceptor};
use super::tunnel::Tunnel;
use crate::error::Result;
use crate::tls::{TlsCodec, TlsEngineFactory, TlsRole};

pub use async_chain::{
    AsyncHttpHeaderParser, AsyncHttpIndexedInterceptor, AsyncHttpInterceptChain, AsyncHttpInterceptor,
    AsyncHttpInterceptorFactory, AsyncHttpStage, AsyncIndexed,
};
pub use bridge::HttpTcpInterceptor;
pub use flush::HttpFlushInterceptor;
pub use indexed::{HttpIndexedInterceptor, Indexed};
pub use parser::HttpHeaderParser;
pub use session::{HttpRequest, HttpResponse, HttpSession};

/// Chain cursor for HTTP interceptors
pub type HttpInterceptChain<'a> = InterceptChain<'a, dyn HttpInterceptor>;

/// Hooks run on a relayed connection viewed as HTTP
///
/// Buffers are plaintext when the session's `is_plaintext` flag is set;
/// otherwise they are whatever bytes travel on the wire. Every hook
/// defaults to forwarding unchanged.
pub trait HttpInterceptor: Send + Sync {
    /// Request bytes from the local client
    ///
    /// # Errors
    ///
    /// An error abandons this buffer.
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_request_next(buffer, session, tunnel)
    }

    /// # Errors
    ///
    /// An error stops the remaining finished hooks.
    fn on_request_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_request_finished_next(session, tunnel)
    }

    /// Response bytes from the real remote server
    ///
    /// # Errors
    ///
    /// An error abandons this buffer.
    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_response_next(buffer, session, tunnel)
    }

    /// # Errors
    ///
    /// An error stops the remaining finished hooks.
    fn on_response_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_response_finished_next(session, tunnel)
    }
}

impl InterceptChain<'_, dyn HttpInterceptor> {
    /// Hand a request buffer to the next interceptor
    ///
    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_request_next(
        &mut self,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_request(self, buffer, session, tunnel),
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_request_finished_next(
        &mut self,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_request_finished(self, session, tunnel),
            None => Ok(()),
        }
    }

    /// Hand a response buffer to the next interceptor
    ///
    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_response_next(
        &mut self,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_response(self, buffer, session, tunnel),
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_response_finished_next(
        &mut self,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_response_finished(self, session, tunnel),
            None => Ok(()),
        }
    }
}

/// Builds a fresh HTTP interceptor for one proxy shard
pub type HttpInterceptorFactory = Arc<dyn Fn() -> Arc<dyn HttpInterceptor> + Send + Sync>;

/// Entry point from the HTTP bridge into the HTTP interceptor list
pub struct HttpVirtualGateway {
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
}

impl HttpVirtualGateway {
    /// Assemble the chain around the user interceptors
    ///
    /// # Arguments
    ///
    /// * `user` - Synchronous interceptors, in order
    /// * `tls_factory` - Engine factory; without one, TLS streams pass through
    ///   as opaque bytes
    /// * `async_stage` - Hand-off to the async interceptor worker
    #[must_use]
    pub fn new(
        user: Vec<Arc<dyn HttpInterceptor>>,
        tls_factory: Option<Arc<dyn TlsEngineFactory>>,
        async_stage: Option<Arc<AsyncHttpStage>>,
    ) -> Self {
        let request_codec = tls_factory
            .as_ref()
            .map(|f| Arc::new(TlsCodec::new(TlsRole::Server, Arc::clone(f))));
        let response_codec = tls_factory.map(|f| Arc::new(TlsCodec::new(TlsRole::Client, f)));

        let mut interceptors: Vec<Arc<dyn HttpInterceptor>> = Vec::with_capacity(user.len() + 4);
        interceptors.push(HttpSslSniffInterceptor::indexed());
        if let (Some(request), Some(response)) = (&request_codec, &response_codec) {
            interceptors.push(Arc::new(HttpSslCodecInterceptor::new(
                Arc::clone(request),
                Arc::clone(response),
            )));
        }
        interceptors.extend(user);
        interceptors.push(HttpHeaderParser::indexed());
        if let Some(stage) = async_stage {
            interceptors.push(stage);
        }
        interceptors.push(Arc::new(HttpFlushInterceptor::new(request_codec, response_codec)));

        Self { interceptors }
    }

    /// Gateway over an explicit list, with no built-in stages
    #[must_use]
    pub fn from_interceptors(interceptors: Vec<Arc<dyn HttpInterceptor>>) -> Self {
        Self { interceptors }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_request(&self, buffer: Bytes, session: &Arc<HttpSession>, tunnel: &dyn Tunnel) -> Result<()> {
        HttpInterceptChain::new(&self.interceptors).process_request_next(buffer, session, tunnel)
    }

    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_request_finished(&self, session: &Arc<HttpSession>, tunnel: &dyn Tunnel) -> Result<()> {
        HttpInterceptChain::new(&self.interceptors).process_request_finished_next(session, tunnel)
    }

    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_response(&self, buffer: Bytes, session: &Arc<HttpSession>, tunnel: &dyn Tunnel) -> Result<()> {
        HttpInterceptChain::new(&self.interceptors).process_response_next(buffer, session, tunnel)
    }

    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_response_finished(&self, session: &Arc<HttpSession>, tunnel: &dyn Tunnel) -> Result<()> {
        HttpInterceptChain::new(&self.interceptors).process_response_finished_next(session, tunnel)
    }
}

impl std::fmt::Debug for HttpVirtualGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVirtualGateway")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::tunnel::tests::RecordingTunnel;
    use crate::packet::{IpAddress, Protocol};
    use crate::session::SessionStore;
    use parking_lot::Mutex;

    fn http_session(port: u16) -> Arc<HttpSession> {
        let tcp = SessionStore::new(Protocol::Tcp).insert(port, IpAddress::V4(0x5DB8_D822), 80);
        Arc::new(HttpSession::new(tcp))
    }

    /// Records the parsed request seen on each buffer
    struct Observe(Arc<Mutex<Vec<HttpRequest>>>);

    impl HttpInterceptor for Observe {
        fn on_request(
            &self,
            chain: &mut HttpInterceptChain<'_>,
            buffer: Bytes,
            session: &Arc<HttpSession>,
            tunnel: &dyn Tunnel,
        ) -> Result<()> {
            self.0.lock().push(session.request_snapshot());
            chain.process_request_next(buffer, session, tunnel)
        }
    }

    /// Swallows every request
    struct Swallow;

    impl HttpInterceptor for Swallow {
        fn on_request(
            &self,
            _chain: &mut HttpInterceptChain<'_>,
            _buffer: Bytes,
            _session: &Arc<HttpSession>,
            _tunnel: &dyn Tunnel,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_plain_http_flows_to_remote() {
        let gateway = HttpVirtualGateway::new(Vec::new(), None, None);
        let session = http_session(41000);
        let tunnel = RecordingTunnel::default();
        let request = b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n";

        gateway
            .on_request(Bytes::from_static(request), &session, &tunnel)
            .expect("Should run");
        gateway
            .on_response(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"), &session, &tunnel)
            .expect("Should run");

        assert_eq!(tunnel.remote_bytes(), request);
        assert_eq!(tunnel.local_bytes(), b"HTTP/1.1 200 OK\r\n\r\n");
        let parsed = session.request_snapshot();
        assert_eq!(parsed.is_https, Some(false));
        assert_eq!(parsed.method.as_deref(), Some("GET"));
        assert_eq!(parsed.url().as_deref(), Some("http://example.com/a"));
        assert_eq!(session.response_snapshot().status.as_deref(), Some("200"));
    }

    #[test]
    fn test_user_interceptor_runs_after_sniff() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gateway = HttpVirtualGateway::new(vec![Arc::new(Observe(Arc::clone(&seen)))], None, None);
        let session = http_session(41001);
        let tunnel = RecordingTunnel::default();

        gateway
            .on_request(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), &session, &tunnel)
            .expect("Should run");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].is_https, Some(false));
        // The header parser runs after user interceptors
        assert!(seen[0].method.is_none());
    }

    #[test]
    fn test_dropping_interceptor_skips_flush() {
        let gateway = HttpVirtualGateway::new(vec![Arc::new(Swallow)], None, None);
        let session = http_session(41002);
        let tunnel = RecordingTunnel::default();

        gateway
            .on_request(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), &session, &tunnel)
            .expect("Should run");

        assert!(tunnel.remote_bytes().is_empty());
    }

    #[test]
    fn test_tls_without_engine_passes_through() {
        let gateway = HttpVirtualGateway::new(Vec::new(), None, None);
        let session = http_session(41003);
        let tunnel = RecordingTunnel::default();
        let hello = [0x16, 0x03, 0x01, 0x00, 0x01, 0x01];

        gateway
            .on_request(Bytes::copy_from_slice(&hello), &session, &tunnel)
            .expect("Should run");

        assert_eq!(tunnel.remote_bytes(), hello);
        assert_eq!(session.request_snapshot().is_https, Some(true));
    }
}

//! Bridge from the TCP chain into the HTTP chain

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use super::session::HttpSession;
use super::HttpVirtualGateway;
use crate::error::Result;
use crate::interceptor::tcp::{TcpInterceptChain, TcpInterceptor};
use crate::interceptor::tunnel::Tunnel;
use crate::session::{Session, SessionKey};

struct Entry {
    session: Arc<HttpSession>,
    request_finished: bool,
    response_finished: bool,
}

/// TCP interceptor running every connection through an [`HttpVirtualGateway`]
///
/// The HTTP session for a TCP session is created on first use and forgotten
/// once both directions have finished.
pub struct HttpTcpInterceptor {
    gateway: HttpVirtualGateway,
    sessions: DashMap<SessionKey, Entry>,
}

impl HttpTcpInterceptor {
    #[must_use]
    pub fn new(gateway: HttpVirtualGateway) -> Self {
        Self {
            gateway,
            sessions: DashMap::new(),
        }
    }

    /// HTTP sessions currently tracked
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn take_http_session(&self, tcp: &Arc<Session>) -> Arc<HttpSession> {
        let entry = self.sessions.entry(tcp.key()).or_insert_with(|| {
            trace!("HTTP session opened for {}", tcp.key());
            Entry {
                session: Arc::new(HttpSession::new(Arc::clone(tcp))),
                request_finished: false,
                response_finished: false,
            }
        });
        Arc::clone(&entry.session)
    }

    fn mark_finished(&self, key: SessionKey, request: bool) {
        let done = self.sessions.get_mut(&key).is_some_and(|mut entry| {
            if request {
                entry.request_finished = true;
            } else {
                entry.response_finished = true;
            }
            entry.request_finished && entry.response_finished
        });
        if done {
            self.sessions.remove(&key);
            trace!("HTTP session closed for {}", key);
        }
    }
}

impl std::fmt::Debug for HttpTcpInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTcpInterceptor")
            .field("gateway", &self.gateway)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl TcpInterceptor for HttpTcpInterceptor {
    fn on_request(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let http = self.take_http_session(session);
        self.gateway.on_request(buffer.clone(), &http, tunnel)?;
        chain.process_request_next(buffer, session, tunnel)
    }

    fn on_request_finished(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let http = self.take_http_session(session);
        let result = self.gateway.on_request_finished(&http, tunnel);
        self.mark_finished(session.key(), true);
        result?;
        chain.process_request_finished_next(session, tunnel)
    }

    fn on_response(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let http = self.take_http_session(session);
        self.gateway.on_response(buffer.clone(), &http, tunnel)?;
        chain.process_response_next(buffer, session, tunnel)
    }

    fn on_response_finished(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let http = self.take_http_session(session);
        let result = self.gateway.on_response_finished(&http, tunnel);
        self.mark_finished(session.key(), false);
        result?;
        chain.process_response_finished_next(session, tunnel)
    }
}

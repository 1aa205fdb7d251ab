//! Byte-level TCP interceptors
//!
//! The TCP gateway is the entry point of a relayed connection: the tunnel
//! pair hands every chunk it reads to [`TcpVirtualGateway`], which runs the
//! shard's TCP interceptor list. The HTTP bridge is normally the last entry
//! of that list.

use std::sync::Arc;

use bytes::Bytes;

use super::chain::InterceptChain;
use super::tunnel::Tunnel;
use crate::error::Result;
use crate::session::Session;

/// Chain cursor for TCP interceptors
pub type TcpInterceptChain<'a> = InterceptChain<'a, dyn TcpInterceptor>;

/// Hooks run on the raw byte stream of a relayed TCP connection
///
/// Every hook defaults to forwarding unchanged.
pub trait TcpInterceptor: Send + Sync {
    /// Bytes read from the local client
    ///
    /// # Errors
    ///
    /// An error abandons this buffer.
    fn on_request(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_request_next(buffer, session, tunnel)
    }

    /// The connection closed; no more request bytes will arrive
    ///
    /// # Errors
    ///
    /// An error stops the remaining finished hooks.
    fn on_request_finished(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_request_finished_next(session, tunnel)
    }

    /// Bytes read from the real remote server
    ///
    /// # Errors
    ///
    /// An error abandons this buffer.
    fn on_response(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_response_next(buffer, session, tunnel)
    }

    /// The connection closed; no more response bytes will arrive
    ///
    /// # Errors
    ///
    /// An error stops the remaining finished hooks.
    fn on_response_finished(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        chain.process_response_finished_next(session, tunnel)
    }
}

impl InterceptChain<'_, dyn TcpInterceptor> {
    /// Hand a request buffer to the next interceptor
    ///
    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_request_next(
        &mut self,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_request(self, buffer, session, tunnel),
            None => Ok(()),
        }
    }

    /// Signal request completion to the next interceptor
    ///
    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_request_finished_next(
        &mut self,
        session: &Arc<Session>,
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
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_response(self, buffer, session, tunnel),
            None => Ok(()),
        }
    }

    /// Signal response completion to the next interceptor
    ///
    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub fn process_response_finished_next(
        &mut self,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_response_finished(self, session, tunnel),
            None => Ok(()),
        }
    }
}

/// Builds a fresh TCP interceptor for one proxy shard
pub type TcpInterceptorFactory = Arc<dyn Fn() -> Arc<dyn TcpInterceptor> + Send + Sync>;

/// Entry point from a tunnel pair into the TCP interceptor list
pub struct TcpVirtualGateway {
    interceptors: Vec<Arc<dyn TcpInterceptor>>,
}

impl TcpVirtualGateway {
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn TcpInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Run the request hooks over a buffer from the local client
    ///
    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_request(&self, buffer: Bytes, session: &Arc<Session>, tunnel: &dyn Tunnel) -> Result<()> {
        TcpInterceptChain::new(&self.interceptors).process_request_next(buffer, session, tunnel)
    }

    /// Run the request-finished hooks
    ///
    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_request_finished(&self, session: &Arc<Session>, tunnel: &dyn Tunnel) -> Result<()> {
        TcpInterceptChain::new(&self.interceptors).process_request_finished_next(session, tunnel)
    }

    /// Run the response hooks over a buffer from the remote server
    ///
    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_response(&self, buffer: Bytes, session: &Arc<Session>, tunnel: &dyn Tunnel) -> Result<()> {
        TcpInterceptChain::new(&self.interceptors).process_response_next(buffer, session, tunnel)
    }

    /// Run the response-finished hooks
    ///
    /// # Errors
    ///
    /// Propagates the first interceptor error.
    pub fn on_response_finished(&self, session: &Arc<Session>, tunnel: &dyn Tunnel) -> Result<()> {
        TcpInterceptChain::new(&self.interceptors).process_response_finished_next(session, tunnel)
    }
}

impl std::fmt::Debug for TcpVirtualGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpVirtualGateway")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Terminal interceptor that writes every buffer to its peer unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpForwardInterceptor;

impl TcpInterceptor for TcpForwardInterceptor {
    fn on_request(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        tunnel.write_to_remote_server(buffer.clone())?;
        chain.process_request_next(buffer, session, tunnel)
    }

    fn on_response(
        &self,
        chain: &mut TcpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<Session>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        tunnel.write_to_local_client(buffer.clone())?;
        chain.process_response_next(buffer, session, tunnel)
    }
}

//! Asynchronous HTTP interceptors
//!
//! Async interceptors observe traffic without holding up the relay. The
//! synchronous chain hands each buffer (deep-copied) to a bounded queue and
//! continues immediately; one worker thread drains the queue in FIFO order
//! through the async chain.
//!
//! ```text
//! reactor thread                      async-http worker (current-thread runtime)
//! ──────────────                      ─────────────────────────────────────────
//! AsyncHttpStage::on_request
//!   try_send(Request(copy, session)) ─► recv ─► header parser ─► user async interceptors
//!   process_request_next (sync chain continues)
//! ```
//!
//! A full queue drops the work item with a warning. The worker exits when the
//! proxy lifecycle stops.

use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::indexed::IndexCounter;
use super::parser::{parse_request_once, parse_response_once};
use super::session::HttpSession;
use super::{HttpInterceptChain, HttpInterceptor};
use crate::error::{ProxyError, Result};
use crate::interceptor::chain::InterceptChain;
use crate::interceptor::tunnel::Tunnel;
use crate::reactor::Lifecycle;

/// Chain cursor for async HTTP interceptors
pub type AsyncHttpInterceptChain<'a> = InterceptChain<'a, dyn AsyncHttpInterceptor>;

/// Observer hooks run on the async worker
///
/// Buffers are private copies; writing to peers is not possible from here.
/// Every hook defaults to forwarding.
#[async_trait]
pub trait AsyncHttpInterceptor: Send + Sync {
    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_request(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        chain.process_request_next(buffer, session).await
    }

    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_request_finished(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        chain.process_request_finished_next(session).await
    }

    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_response(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        chain.process_response_next(buffer, session).await
    }

    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_response_finished(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        chain.process_response_finished_next(session).await
    }
}

impl InterceptChain<'_, dyn AsyncHttpInterceptor> {
    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub async fn process_request_next(&mut self, buffer: Bytes, session: &Arc<HttpSession>) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_request(self, buffer, session).await,
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub async fn process_request_finished_next(&mut self, session: &Arc<HttpSession>) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_request_finished(self, session).await,
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub async fn process_response_next(&mut self, buffer: Bytes, session: &Arc<HttpSession>) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_response(self, buffer, session).await,
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Propagates the next interceptor's error.
    pub async fn process_response_finished_next(&mut self, session: &Arc<HttpSession>) -> Result<()> {
        match self.advance() {
            Some(next) => next.on_response_finished(self, session).await,
            None => Ok(()),
        }
    }
}

/// Async hooks that receive the per-direction buffer index
#[async_trait]
pub trait AsyncHttpIndexedInterceptor: Send + Sync {
    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_request(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        _index: usize,
    ) -> Result<()> {
        chain.process_request_next(buffer, session).await
    }

    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_request_finished(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        _index: usize,
    ) -> Result<()> {
        chain.process_request_finished_next(session).await
    }

    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_response(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        _index: usize,
    ) -> Result<()> {
        chain.process_response_next(buffer, session).await
    }

    /// # Errors
    ///
    /// An error is logged and ends this work item.
    async fn on_response_finished(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        _index: usize,
    ) -> Result<()> {
        chain.process_response_finished_next(session).await
    }
}

/// Adapter running an [`AsyncHttpIndexedInterceptor`] as an
/// [`AsyncHttpInterceptor`]
#[derive(Debug, Default)]
pub struct AsyncIndexed<T> {
    inner: T,
    counter: IndexCounter,
}

impl<T> AsyncIndexed<T> {
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            counter: IndexCounter::default(),
        }
    }
}

#[async_trait]
impl<T: AsyncHttpIndexedInterceptor> AsyncHttpInterceptor for AsyncIndexed<T> {
    async fn on_request(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        let index = self.counter.next_request(session.key());
        self.inner.on_request(chain, buffer, session, index).await
    }

    async fn on_request_finished(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        let index = self.counter.finish_request(session.key());
        self.inner.on_request_finished(chain, session, index).await
    }

    async fn on_response(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        let index = self.counter.next_response(session.key());
        self.inner.on_response(chain, buffer, session, index).await
    }

    async fn on_response_finished(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
    ) -> Result<()> {
        let index = self.counter.finish_response(session.key());
        self.inner.on_response_finished(chain, session, index).await
    }
}

/// Header parser for the async chain
///
/// Leaves records already filled by the synchronous parser untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct AsyncHttpHeaderParser;

#[async_trait]
impl AsyncHttpIndexedInterceptor for AsyncHttpHeaderParser {
    async fn on_request(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        index: usize,
    ) -> Result<()> {
        parse_request_once(&buffer, session, index);
        chain.process_request_next(buffer, session).await
    }

    async fn on_response(
        &self,
        chain: &mut AsyncHttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        index: usize,
    ) -> Result<()> {
        parse_response_once(&buffer, session, index);
        chain.process_response_next(buffer, session).await
    }
}

/// Builds a fresh async interceptor when the proxy starts
pub type AsyncHttpInterceptorFactory = Arc<dyn Fn() -> Arc<dyn AsyncHttpInterceptor> + Send + Sync>;

#[derive(Debug)]
enum AsyncWork {
    Request(Bytes, Arc<HttpSession>),
    RequestFinished(Arc<HttpSession>),
    Response(Bytes, Arc<HttpSession>),
    ResponseFinished(Arc<HttpSession>),
}

impl AsyncWork {
    const fn stage(&self) -> &'static str {
        match self {
            Self::Request(..) => "request",
            Self::RequestFinished(_) => "request_finished",
            Self::Response(..) => "response",
            Self::ResponseFinished(_) => "response_finished",
        }
    }
}

/// Synchronous chain stage feeding the async worker
#[derive(Debug)]
pub struct AsyncHttpStage {
    sender: mpsc::Sender<AsyncWork>,
}

impl AsyncHttpStage {
    /// Start the worker thread
    ///
    /// The async header parser is placed ahead of `interceptors`.
    ///
    /// # Arguments
    ///
    /// * `interceptors` - User async interceptors, in order
    /// * `capacity` - Bound of the work queue
    /// * `lifecycle` - Stopping it ends the worker
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reactor` if the runtime or thread cannot be
    /// created.
    pub fn spawn(
        interceptors: Vec<Arc<dyn AsyncHttpInterceptor>>,
        capacity: usize,
        lifecycle: &Lifecycle,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| ProxyError::Reactor(format!("async interceptor runtime: {e}")))?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        lifecycle.on_stop(move || {
            let _ = stop_tx.send(());
        });

        let mut chain: Vec<Arc<dyn AsyncHttpInterceptor>> = Vec::with_capacity(interceptors.len() + 1);
        chain.push(Arc::new(AsyncIndexed::new(AsyncHttpHeaderParser)));
        chain.extend(interceptors);

        let handle = std::thread::Builder::new()
            .name("async-http".into())
            .spawn(move || runtime.block_on(run_worker(chain, receiver, stop_rx)))
            .map_err(|e| ProxyError::Reactor(format!("async interceptor thread: {e}")))?;

        Ok((Arc::new(Self { sender }), handle))
    }

    fn submit(&self, work: AsyncWork) {
        match self.sender.try_send(work) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(work)) => {
                warn!("Async interceptor queue full, dropping {} work", work.stage());
            }
            Err(mpsc::error::TrySendError::Closed(work)) => {
                trace!("Async interceptor worker gone, dropping {} work", work.stage());
            }
        }
    }
}

async fn run_worker(
    interceptors: Vec<Arc<dyn AsyncHttpInterceptor>>,
    mut receiver: mpsc::Receiver<AsyncWork>,
    mut stop: oneshot::Receiver<()>,
) {
    debug!("Async interceptor worker started with {} interceptors", interceptors.len());
    loop {
        tokio::select! {
            _ = &mut stop => break,
            work = receiver.recv() => {
                let Some(work) = work else { break };
                let stage = work.stage();
                let mut chain = AsyncHttpInterceptChain::new(&interceptors);
                let result = match work {
                    AsyncWork::Request(buffer, session) => chain.process_request_next(buffer, &session).await,
                    AsyncWork::RequestFinished(session) => chain.process_request_finished_next(&session).await,
                    AsyncWork::Response(buffer, session) => chain.process_response_next(buffer, &session).await,
                    AsyncWork::ResponseFinished(session) => chain.process_response_finished_next(&session).await,
                };
                if let Err(e) = result {
                    warn!("Async interceptor failed on {}: {}", stage, e);
                }
            }
        }
    }
    debug!("Async interceptor worker stopped");
}

impl HttpInterceptor for AsyncHttpStage {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        self.submit(AsyncWork::Request(Bytes::copy_from_slice(&buffer), Arc::clone(session)));
        chain.process_request_next(buffer, session, tunnel)
    }

    fn on_request_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        self.submit(AsyncWork::RequestFinished(Arc::clone(session)));
        chain.process_request_finished_next(session, tunnel)
    }

    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        self.submit(AsyncWork::Response(Bytes::copy_from_slice(&buffer), Arc::clone(session)));
        chain.process_response_next(buffer, session, tunnel)
    }

    fn on_response_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        self.submit(AsyncWork::ResponseFinished(Arc::clone(session)));
        chain.process_response_finished_next(session, tunnel)
    }
}

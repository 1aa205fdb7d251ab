//! Per-session call counting for HTTP interceptors
//!
//! Many stages only care about the first buffer of each direction (sniffing,
//! header parsing). [`Indexed`] wraps such a stage and tells it how many
//! buffers of the same direction it has already seen on this session.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use super::session::HttpSession;
use super::{HttpInterceptChain, HttpInterceptor};
use crate::error::Result;
use crate::interceptor::tunnel::Tunnel;
use crate::session::SessionKey;

/// HTTP interceptor hooks that receive the per-direction buffer index
///
/// `index` is 0 on the first buffer of a direction and increases by one per
/// buffer. The finished hooks receive one past the last buffer index (0 if
/// the direction never carried data).
pub trait HttpIndexedInterceptor: Send + Sync {
    /// # Errors
    ///
    /// An error abandons this buffer.
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
        _index: usize,
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
        _index: usize,
    ) -> Result<()> {
        chain.process_request_finished_next(session, tunnel)
    }

    /// # Errors
    ///
    /// An error abandons this buffer.
    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
        _index: usize,
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
        _index: usize,
    ) -> Result<()> {
        chain.process_response_finished_next(session, tunnel)
    }
}

/// Per-direction buffer counters keyed by session
#[derive(Debug, Default)]
pub(crate) struct IndexCounter {
    request: DashMap<SessionKey, usize>,
    response: DashMap<SessionKey, usize>,
}

impl IndexCounter {
    /// Index of the buffer being delivered now
    pub(crate) fn next_request(&self, key: SessionKey) -> usize {
        Self::bump(&self.request, key)
    }

    pub(crate) fn next_response(&self, key: SessionKey) -> usize {
        Self::bump(&self.response, key)
    }

    /// Index handed to the request-finished hook; forgets the session
    pub(crate) fn finish_request(&self, key: SessionKey) -> usize {
        self.request.remove(&key).map_or(0, |(_, last)| last + 1)
    }

    pub(crate) fn finish_response(&self, key: SessionKey) -> usize {
        self.response.remove(&key).map_or(0, |(_, last)| last + 1)
    }

    fn bump(map: &DashMap<SessionKey, usize>, key: SessionKey) -> usize {
        let mut entry = map.entry(key).or_insert(usize::MAX);
        *entry = entry.wrapping_add(1);
        *entry
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.request.len() + self.response.len()
    }
}

/// Adapter running an [`HttpIndexedInterceptor`] as an [`HttpInterceptor`]
#[derive(Debug, Default)]
pub struct Indexed<T> {
    inner: T,
    counter: IndexCounter,
}

impl<T> Indexed<T> {
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            counter: IndexCounter::default(),
        }
    }

    #[must_use]
    pub const fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: HttpIndexedInterceptor> HttpInterceptor for Indexed<T> {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let index = self.counter.next_request(session.key());
        self.inner.on_request(chain, buffer, session, tunnel, index)
    }

    fn on_request_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let index = self.counter.finish_request(session.key());
        self.inner.on_request_finished(chain, session, tunnel, index)
    }

    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let index = self.counter.next_response(session.key());
        self.inner.on_response(chain, buffer, session, tunnel, index)
    }

    fn on_response_finished(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> Result<()> {
        let index = self.counter.finish_response(session.key());
        self.inner.on_response_finished(chain, session, tunnel, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::http::HttpVirtualGateway;
    use crate::interceptor::tunnel::tests::RecordingTunnel;
    use crate::packet::{IpAddress, Protocol};
    use crate::session::SessionStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Indices {
        seen: Mutex<Vec<(&'static str, usize)>>,
    }

    impl HttpIndexedInterceptor for Arc<Indices> {
        fn on_request(
            &self,
            chain: &mut HttpInterceptChain<'_>,
            buffer: Bytes,
            session: &Arc<HttpSession>,
            tunnel: &dyn Tunnel,
            index: usize,
        ) -> Result<()> {
            self.seen.lock().push(("request", index));
            chain.process_request_next(buffer, session, tunnel)
        }

        fn on_request_finished(
            &self,
            chain: &mut HttpInterceptChain<'_>,
            session: &Arc<HttpSession>,
            tunnel: &dyn Tunnel,
            index: usize,
        ) -> Result<()> {
            self.seen.lock().push(("request_finished", index));
            chain.process_request_finished_next(session, tunnel)
        }

        fn on_response_finished(
            &self,
            chain: &mut HttpInterceptChain<'_>,
            session: &Arc<HttpSession>,
            tunnel: &dyn Tunnel,
            index: usize,
        ) -> Result<()> {
            self.seen.lock().push(("response_finished", index));
            chain.process_response_finished_next(session, tunnel)
        }
    }

    fn http_session(port: u16) -> Arc<HttpSession> {
        let tcp = SessionStore::new(Protocol::Tcp).insert(port, IpAddress::V4(0x0A00_0001), 80);
        Arc::new(HttpSession::new(tcp))
    }

    #[test]
    fn test_index_counts_per_session() {
        let indices = Arc::new(Indices::default());
        let gateway = HttpVirtualGateway::from_interceptors(vec![Arc::new(Indexed::new(Arc::clone(&indices)))]);
        let tunnel = RecordingTunnel::default();
        let a = http_session(42000);
        let b = http_session(42001);

        for session in [&a, &a, &b, &a] {
            gateway
                .on_request(Bytes::from_static(b"x"), session, &tunnel)
                .expect("Should run");
        }
        gateway.on_request_finished(&a, &tunnel).expect("Should run");
        gateway.on_response_finished(&a, &tunnel).expect("Should run");

        assert_eq!(
            indices.seen.lock().as_slice(),
            &[
                ("request", 0),
                ("request", 1),
                ("request", 0),
                ("request", 2),
                ("request_finished", 3),
                ("response_finished", 0),
            ]
        );
    }

    #[test]
    fn test_finish_forgets_session() {
        let counter = IndexCounter::default();
        let key = SessionKey::new(1, IpAddress::V4(1), 2);
        assert_eq!(counter.next_request(key), 0);
        assert_eq!(counter.next_response(key), 0);
        assert_eq!(counter.tracked(), 2);
        assert_eq!(counter.finish_request(key), 1);
        assert_eq!(counter.finish_response(key), 1);
        assert_eq!(counter.tracked(), 0);
        assert_eq!(counter.next_request(key), 0);
    }
}

//! Proxy assembly and lifecycle
//!
//! [`InterceptionProxy`] collects the pieces a host supplies (configuration,
//! interceptor factories, socket protector, TLS engine factory, event
//! listeners) and [`InterceptionProxy::start`] wires them into running
//! threads. Everything those threads share lives in one [`ProxyContext`],
//! built fresh for every start.
//!
//! ```text
//!                         ProxyContext (config, lifecycle, sessions, protector, events)
//!                               │
//!   TunDevice ─► packet-dispatcher ──TCP──► TcpPacketInterceptor ─► tcp-shard-0..N (mio)
//!                               │                    └─(optional)─► tcp-shaper
//!                               └───UDP──► UdpPacketInterceptor ──► udp-relay (mio)
//!
//!   tcp-shard-N: TcpVirtualGateway [user TCP ..., HttpTcpInterceptor]
//!                                                  └─ HttpVirtualGateway ─► async-http (tokio)
//! ```
//!
//! Stopping the handle flips the shared lifecycle. Reactors and workers wake
//! and exit on their own; the dispatcher exits after its next read returns,
//! so a blocking tunnel device should be closed by the host after `stop()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::dispatcher::{PacketDispatcher, TunDevice};
use crate::error::{ProxyError, Result};
use crate::event::{EventBus, EventListener, EventSynopsis, ImportantEvent};
use crate::interceptor::http::{AsyncHttpInterceptorFactory, AsyncHttpStage, HttpInterceptorFactory};
use crate::interceptor::{HttpTcpInterceptor, HttpVirtualGateway, TcpInterceptor, TcpInterceptorFactory, TcpVirtualGateway};
use crate::packet::Protocol;
use crate::protect::{NoOpSocketProtector, SocketProtector};
use crate::reactor::Lifecycle;
use crate::session::SessionStore;
use crate::tcp::{ShapedWriter, TcpPacketInterceptor, TcpProxyServer};
use crate::tls::TlsEngineFactory;
use crate::udp::{UdpPacketInterceptor, UdpProxyServer};

/// State shared by every component of one running proxy
pub struct ProxyContext {
    config: ProxyConfig,
    lifecycle: Arc<Lifecycle>,
    tcp_sessions: Arc<SessionStore>,
    udp_sessions: Arc<SessionStore>,
    protector: Arc<dyn SocketProtector>,
    events: Arc<EventBus>,
}

impl ProxyContext {
    /// Create a live context with empty session tables
    #[must_use]
    pub fn new(config: ProxyConfig, protector: Arc<dyn SocketProtector>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            lifecycle: Lifecycle::new(),
            tcp_sessions: Arc::new(SessionStore::new(Protocol::Tcp)),
            udp_sessions: Arc::new(SessionStore::new(Protocol::Udp)),
            protector,
            events,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ProxyConfig {
        &self.config
    }

    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    #[must_use]
    pub const fn tcp_sessions(&self) -> &Arc<SessionStore> {
        &self.tcp_sessions
    }

    #[must_use]
    pub const fn udp_sessions(&self) -> &Arc<SessionStore> {
        &self.udp_sessions
    }

    #[must_use]
    pub fn protector(&self) -> &dyn SocketProtector {
        self.protector.as_ref()
    }

    #[must_use]
    pub const fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Post an unreachable event for `remote`
    pub fn report_unreachable(&self, remote: SocketAddr, cause: &dyn std::error::Error) {
        let event = ImportantEvent::new(
            format!("Failed to reach {remote}"),
            EventSynopsis::unreachable(remote.is_ipv6()),
            Some(cause),
        );
        self.events.post(&event);
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("alive", &self.lifecycle.is_alive())
            .field("tcp_sessions", &self.tcp_sessions.len())
            .field("udp_sessions", &self.udp_sessions.len())
            .finish_non_exhaustive()
    }
}

/// Builder for a running interception proxy
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tun_interceptor::config::ProxyConfig;
/// use tun_interceptor::dispatcher::TunDevice;
/// use tun_interceptor::proxy::InterceptionProxy;
///
/// # fn example(tun: Arc<dyn TunDevice>) -> tun_interceptor::Result<()> {
/// let mut proxy = InterceptionProxy::new(ProxyConfig::default());
/// proxy.add_event_listener(Arc::new(|event: &tun_interceptor::event::ImportantEvent| {
///     eprintln!("{}: {}", event.synopsis, event.message);
/// }));
/// let handle = proxy.start(tun)?;
/// handle.stop();
/// handle.join()?;
/// # Ok(())
/// # }
/// ```
pub struct InterceptionProxy {
    config: ProxyConfig,
    protector: Arc<dyn SocketProtector>,
    events: Arc<EventBus>,
    tcp_factories: Vec<TcpInterceptorFactory>,
    http_factories: Vec<HttpInterceptorFactory>,
    async_http_factories: Vec<AsyncHttpInterceptorFactory>,
    tls_factory: Option<Arc<dyn TlsEngineFactory>>,
}

impl InterceptionProxy {
    /// Create a builder with no interceptors and a no-op protector
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            protector: Arc::new(NoOpSocketProtector),
            events: Arc::new(EventBus::new()),
            tcp_factories: Vec::new(),
            http_factories: Vec::new(),
            async_http_factories: Vec::new(),
            tls_factory: None,
        }
    }

    /// Set the hook that keeps relay sockets out of the tunnel
    pub fn with_protector(&mut self, protector: Arc<dyn SocketProtector>) -> &mut Self {
        self.protector = protector;
        self
    }

    pub fn add_event_listener(&mut self, listener: Arc<dyn EventListener>) -> &mut Self {
        self.events.add_listener(listener);
        self
    }

    /// Add a byte-level interceptor, created once per shard
    ///
    /// TCP interceptors run before the HTTP pipeline and in insertion order.
    pub fn add_tcp_interceptor(&mut self, factory: TcpInterceptorFactory) -> &mut Self {
        self.tcp_factories.push(factory);
        self
    }

    /// Add an HTTP interceptor, created once per shard
    pub fn add_http_interceptor(&mut self, factory: HttpInterceptorFactory) -> &mut Self {
        self.http_factories.push(factory);
        self
    }

    /// Add an offloaded HTTP interceptor, created once for the async worker
    pub fn add_async_http_interceptor(&mut self, factory: AsyncHttpInterceptorFactory) -> &mut Self {
        self.async_http_factories.push(factory);
        self
    }

    /// Enable TLS interception with the given engine factory
    pub fn with_tls_engine_factory(&mut self, factory: Arc<dyn TlsEngineFactory>) -> &mut Self {
        self.tls_factory = Some(factory);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Validate the configuration and start every background thread
    ///
    /// Startup order is async worker, TCP shards, UDP relay, optional
    /// bandwidth shaper and finally the dispatcher, so no frame is read
    /// before its destination is listening.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid configuration, or the bind/spawn
    /// error of the first component that failed. Components already started
    /// are stopped before returning.
    pub fn start(&self, tun: Arc<dyn TunDevice>) -> Result<ProxyHandle> {
        self.config.validate()?;
        let context = ProxyContext::new(self.config.clone(), Arc::clone(&self.protector), Arc::clone(&self.events));
        let mut threads = Threads::default();

        match self.start_components(&context, tun, &mut threads) {
            Ok(shard_ports) => {
                info!(
                    shards = shard_ports.len(),
                    ipv6 = self.config.enable_ipv6,
                    tls = self.tls_factory.is_some(),
                    "Interception proxy started"
                );
                Ok(ProxyHandle {
                    context,
                    shard_ports,
                    threads,
                })
            }
            Err(e) => {
                error!("Interception proxy failed to start: {}", e);
                context.lifecycle().stop();
                threads.join();
                Err(e)
            }
        }
    }

    fn start_components(
        &self,
        context: &Arc<ProxyContext>,
        tun: Arc<dyn TunDevice>,
        threads: &mut Threads,
    ) -> Result<Vec<u16>> {
        let async_stage = if self.async_http_factories.is_empty() {
            None
        } else {
            let interceptors = self.async_http_factories.iter().map(|f| f()).collect();
            let (stage, handle) =
                AsyncHttpStage::spawn(interceptors, self.config.async_queue_capacity, context.lifecycle())?;
            threads.workers.push(handle);
            Some(stage)
        };

        let mut shard_ports = Vec::with_capacity(self.config.tcp_proxy_server_count);
        for index in 0..self.config.tcp_proxy_server_count {
            let gateway = self.shard_gateway(async_stage.clone());
            let server = TcpProxyServer::bind(index, gateway, Arc::clone(context))?;
            shard_ports.push(server.port());
            threads.loops.push(server.spawn()?);
        }

        let (handoff, udp_handle) = UdpProxyServer::spawn(Arc::clone(context), Arc::clone(&tun))?;
        threads.loops.push(udp_handle);

        let mut tcp = TcpPacketInterceptor::new(
            Arc::clone(context.tcp_sessions()),
            shard_ports.clone(),
            self.config.proxy_address,
            self.config.ipv6_proxy_address,
        );
        if self.config.bandwidth.is_enabled() {
            let (shaper, handle) =
                ShapedWriter::spawn(&self.config.bandwidth, Arc::clone(&tun), Arc::clone(context.lifecycle()))?;
            threads.workers.push(handle);
            tcp = tcp.with_shaper(shaper);
        }
        let udp = UdpPacketInterceptor::new(Arc::clone(context.udp_sessions()), handoff);

        let dispatcher = PacketDispatcher::new(
            self.config.mtu,
            self.config.enable_ipv6,
            tun,
            Arc::new(tcp),
            Arc::new(udp),
            Arc::clone(context.lifecycle()),
        );
        let handle = std::thread::Builder::new()
            .name("packet-dispatcher".into())
            .spawn(move || dispatcher.run())
            .map_err(|e| ProxyError::Reactor(format!("dispatcher thread: {e}")))?;
        threads.loops.push(handle);

        Ok(shard_ports)
    }

    /// TCP chain of one shard: user TCP interceptors, then the HTTP bridge
    fn shard_gateway(&self, async_stage: Option<Arc<AsyncHttpStage>>) -> Arc<TcpVirtualGateway> {
        let http_user = self.http_factories.iter().map(|f| f()).collect();
        let http = HttpVirtualGateway::new(http_user, self.tls_factory.clone(), async_stage);

        let mut tcp: Vec<Arc<dyn TcpInterceptor>> = self.tcp_factories.iter().map(|f| f()).collect();
        tcp.push(Arc::new(HttpTcpInterceptor::new(http)));
        debug!(tcp_interceptors = tcp.len(), "Shard gateway assembled");
        Arc::new(TcpVirtualGateway::new(tcp))
    }
}

impl std::fmt::Debug for InterceptionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionProxy")
            .field("config", &self.config)
            .field("tcp_interceptors", &self.tcp_factories.len())
            .field("http_interceptors", &self.http_factories.len())
            .field("async_http_interceptors", &self.async_http_factories.len())
            .field("tls", &self.tls_factory.is_some())
            .finish_non_exhaustive()
    }
}

/// Threads of one running proxy
#[derive(Default)]
struct Threads {
    /// Dispatcher and reactors, which report how they ended
    loops: Vec<JoinHandle<Result<()>>>,
    /// Async worker and shaper
    workers: Vec<JoinHandle<()>>,
}

impl Threads {
    /// Wait for every thread, returning the first loop error
    fn join(self) -> Result<()> {
        let mut first_error = None;
        for handle in self.loops {
            let name = handle.thread().name().unwrap_or("proxy").to_string();
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(ProxyError::Reactor(format!("{name} panicked")).into()));
            if let Err(e) = outcome {
                warn!(thread = %name, "Proxy thread ended with error: {}", e);
                first_error.get_or_insert(e);
            }
        }
        for handle in self.workers {
            if handle.join().is_err() {
                warn!("Proxy worker thread panicked");
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// A running proxy
pub struct ProxyHandle {
    context: Arc<ProxyContext>,
    shard_ports: Vec<u16>,
    threads: Threads,
}

impl ProxyHandle {
    #[must_use]
    pub const fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    /// Listening port of each TCP shard, in shard order
    #[must_use]
    pub fn shard_ports(&self) -> &[u16] {
        &self.shard_ports
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.context.lifecycle().is_alive()
    }

    /// Signal every component to stop. Only the first call has an effect.
    pub fn stop(&self) {
        if self.is_running() {
            info!("Interception proxy stopping");
        }
        self.context.lifecycle().stop();
    }

    /// Wait for every thread to finish
    ///
    /// # Errors
    ///
    /// Returns the first error a dispatcher or reactor loop ended with.
    pub fn join(self) -> Result<()> {
        let result = self.threads.join();
        info!("Interception proxy stopped");
        result
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("context", &self.context)
            .field("shard_ports", &self.shard_ports)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::error::InterceptorError;

    /// A tunnel with nothing to read
    struct IdleTun;

    impl TunDevice for IdleTun {
        fn read_packet(&self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(10));
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn write_packet(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_report_unreachable_posts_by_version() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.add_listener(Arc::new(move |event: &ImportantEvent| {
            sink.lock().push(event.synopsis);
        }));
        let context = ProxyContext::new(ProxyConfig::default(), Arc::new(NoOpSocketProtector), events);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        context.report_unreachable("10.0.0.1:80".parse().expect("Should parse v4"), &refused);
        context.report_unreachable("[fd00::1]:443".parse().expect("Should parse v6"), &refused);

        assert_eq!(
            *seen.lock(),
            vec![EventSynopsis::Ipv4Unreachable, EventSynopsis::Ipv6Unreachable]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProxyConfig {
            tcp_proxy_server_count: 0,
            ..ProxyConfig::default()
        };
        let proxy = InterceptionProxy::new(config);
        let err = proxy.start(Arc::new(IdleTun)).expect_err("Should reject zero shards");
        assert!(matches!(err, InterceptorError::Config(_)));
    }

    #[test]
    fn test_start_and_stop() {
        let config = ProxyConfig {
            tcp_proxy_server_count: 2,
            ..ProxyConfig::default()
        };
        let proxy = InterceptionProxy::new(config);
        let handle = proxy.start(Arc::new(IdleTun)).expect("Should start");

        assert!(handle.is_running());
        assert_eq!(handle.shard_ports().len(), 2);
        assert_ne!(handle.shard_ports()[0], handle.shard_ports()[1]);
        assert!(handle.context().tcp_sessions().is_empty());

        handle.stop();
        assert!(!handle.is_running());
        handle.join().expect("Should stop cleanly");
    }

    #[test]
    fn test_factories_called_per_shard() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use crate::interceptor::HttpInterceptor;

        struct Noop;
        impl HttpInterceptor for Noop {}
        impl TcpInterceptor for Noop {}

        let tcp_calls = Arc::new(AtomicUsize::new(0));
        let http_calls = Arc::new(AtomicUsize::new(0));
        let (tcp_counter, http_counter) = (Arc::clone(&tcp_calls), Arc::clone(&http_calls));

        let config = ProxyConfig {
            tcp_proxy_server_count: 3,
            ..ProxyConfig::default()
        };
        let mut proxy = InterceptionProxy::new(config);
        proxy
            .add_tcp_interceptor(Arc::new(move || {
                tcp_counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(Noop) as Arc<dyn TcpInterceptor>
            }))
            .add_http_interceptor(Arc::new(move || {
                http_counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(Noop) as Arc<dyn HttpInterceptor>
            }));

        let handle = proxy.start(Arc::new(IdleTun)).expect("Should start");
        handle.stop();
        handle.join().expect("Should stop cleanly");

        assert_eq!(tcp_calls.load(Ordering::SeqCst), 3);
        assert_eq!(http_calls.load(Ordering::SeqCst), 3);
    }
}

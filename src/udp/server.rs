//! Shared UDP relay reactor
//!
//! The dispatcher hands client datagrams over through a bounded lock-free
//! queue and wakes the reactor. The relay then finds or opens the
//! [`UdpRealTunnel`] for the datagram's source port and sends the payload.
//!
//! ```text
//! dispatcher ── UdpHandoff::submit ──► ArrayQueue ── Waker ──► UdpRelay (wake handler)
//!                                                               │ per source port
//!                                                               ▼
//!                                                         UdpRealTunnel ◄──► remote
//! ```
//!
//! A failed connect or send drops the tunnel together with its session; the
//! next datagram from that port opens fresh ones.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use mio::{Registry, Token, Waker};
use tracing::{debug, info, trace, warn};

use super::tunnel::{ResponseTemplate, TunnelMap, UdpRealTunnel};
use crate::dispatcher::TunDevice;
use crate::error::{ProxyError, Result};
use crate::protect::connect_protected_datagram;
use crate::proxy::ProxyContext;
use crate::reactor::{Channel, Reactor, ReactorContext};
use crate::session::Session;

/// Datagrams queued between the dispatcher and the relay
const HANDOFF_CAPACITY: usize = 4096;

/// Shortest interval between idle sweeps
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// One client datagram on its way to the relay
#[derive(Debug)]
pub struct UdpRequest {
    pub session: Arc<Session>,
    pub template: ResponseTemplate,
    pub payload: Bytes,
}

/// Sending side of the relay queue
#[derive(Clone)]
pub struct UdpHandoff {
    queue: Arc<ArrayQueue<UdpRequest>>,
    waker: Arc<Waker>,
}

impl UdpHandoff {
    /// Queue a datagram without blocking
    ///
    /// A full queue drops the datagram.
    pub fn submit(&self, request: UdpRequest) {
        if let Err(request) = self.queue.push(request) {
            warn!(session = %request.session, "UDP relay queue full, datagram dropped");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake UDP relay: {}", e);
        }
    }
}

impl std::fmt::Debug for UdpHandoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpHandoff")
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// The single UDP relay
pub struct UdpProxyServer;

impl UdpProxyServer {
    /// Start the relay reactor on its own thread
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reactor` if the thread or reactor cannot be
    /// created.
    pub fn spawn(context: Arc<ProxyContext>, tun: Arc<dyn TunDevice>) -> Result<(UdpHandoff, JoinHandle<Result<()>>)> {
        let queue = Arc::new(ArrayQueue::new(HANDOFF_CAPACITY));
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<Arc<Waker>>>(1);
        let relay_queue = Arc::clone(&queue);

        let handle = std::thread::Builder::new()
            .name("udp-relay".into())
            .spawn(move || {
                let mut reactor = match Reactor::new("udp-relay", Arc::clone(context.lifecycle())) {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        let message = e.to_string();
                        let _ = ready_tx.send(Err(e));
                        return Err(ProxyError::Reactor(message).into());
                    }
                };
                let idle_timeout = context.config().udp.idle_timeout();
                let relay = Rc::new(RefCell::new(UdpRelay {
                    queue: relay_queue,
                    tunnels: Rc::new(RefCell::new(HashMap::new())),
                    mtu: context.config().mtu,
                    idle_timeout,
                    context,
                    tun,
                }));
                reactor.set_wake_handler(Rc::clone(&relay) as _);
                if let Some(timeout) = idle_timeout {
                    reactor.set_timer((timeout / 2).max(MIN_SWEEP_INTERVAL), relay);
                }
                let _ = ready_tx.send(Ok(reactor.waker()));
                info!("UDP relay started");
                reactor.run()
            })
            .map_err(|e| ProxyError::Reactor(format!("udp relay thread: {e}")))?;

        let waker = ready_rx
            .recv()
            .map_err(|_| ProxyError::Reactor("udp relay exited during startup".into()))??;
        Ok((UdpHandoff { queue, waker }, handle))
    }
}

struct UdpRelay {
    queue: Arc<ArrayQueue<UdpRequest>>,
    tunnels: TunnelMap,
    mtu: usize,
    idle_timeout: Option<Duration>,
    context: Arc<ProxyContext>,
    tun: Arc<dyn TunDevice>,
}

impl UdpRelay {
    fn tunnel_for(&self, request: &UdpRequest, ctx: &mut ReactorContext<'_>) -> Option<Rc<RefCell<UdpRealTunnel>>> {
        let port = request.session.source_port().get();
        let existing = self.tunnels.borrow().get(&port).cloned();
        if let Some(tunnel) = existing {
            if tunnel.borrow().session().key() == request.session.key() {
                return Some(tunnel);
            }
            // The client reused the port for another destination
            let token = tunnel.borrow().token();
            tunnel.borrow_mut().close(ctx.registry());
            ctx.detach(token);
        }

        let session = &request.session;
        let remote = SocketAddr::new(session.destination_address().to_std(), session.destination_port().get());
        let socket = match connect_protected_datagram(remote, self.context.protector()) {
            Ok(socket) => socket,
            Err(e) => {
                self.context.udp_sessions().remove(session);
                self.context.report_unreachable(remote, &e);
                return None;
            }
        };
        let tunnel = match UdpRealTunnel::open(
            Arc::clone(session),
            socket,
            remote,
            request.template.clone(),
            Arc::clone(&self.tun),
            self.mtu,
            Rc::clone(&self.tunnels),
            Arc::clone(self.context.udp_sessions()),
            ctx,
        ) {
            Ok(tunnel) => Rc::new(RefCell::new(tunnel)),
            Err(e) => {
                warn!(session = %session, "Failed to open UDP tunnel: {}", e);
                self.context.udp_sessions().remove(session);
                return None;
            }
        };
        let token = tunnel.borrow().token();
        ctx.attach(token, Rc::clone(&tunnel) as _);
        self.tunnels.borrow_mut().insert(port, Rc::clone(&tunnel));
        Some(tunnel)
    }

    fn forward(&self, request: UdpRequest, ctx: &mut ReactorContext<'_>) {
        let Some(tunnel) = self.tunnel_for(&request, ctx) else {
            return;
        };
        trace!(session = %request.session, "UDP request {} bytes", request.payload.len());
        let mut tunnel = tunnel.borrow_mut();
        if let Err(e) = tunnel.send(request.payload, ctx.registry()) {
            warn!(session = %request.session, "UDP send failed, dropping tunnel: {}", e);
            let token = tunnel.token();
            tunnel.close(ctx.registry());
            ctx.detach(token);
        }
    }
}

impl Channel for UdpRelay {
    fn on_readable(&mut self, _token: Token, ctx: &mut ReactorContext<'_>) -> Result<()> {
        while let Some(request) = self.queue.pop() {
            self.forward(request, ctx);
        }
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ReactorContext<'_>) -> Result<()> {
        let Some(timeout) = self.idle_timeout else {
            return Ok(());
        };
        let expired: Vec<_> = self
            .tunnels
            .borrow()
            .values()
            .filter(|t| t.borrow().session().idle_time() > timeout)
            .cloned()
            .collect();
        for tunnel in expired {
            let mut tunnel = tunnel.borrow_mut();
            debug!(session = %tunnel.session(), "UDP tunnel idle, evicting");
            let token = tunnel.token();
            tunnel.close(ctx.registry());
            ctx.detach(token);
        }
        Ok(())
    }

    fn release(&mut self, _registry: &Registry) {
        while self.queue.pop().is_some() {}
        self.tunnels.borrow_mut().clear();
        self.context.udp_sessions().clear();
        debug!("UDP relay released");
    }
}

//! Readiness-driven reactor
//!
//! A single-threaded loop over a `mio::Poll`. Each registered socket maps to
//! a [`Channel`]; on every iteration each ready channel receives exactly one
//! callback, chosen by its phase and the readiness that fired:
//!
//! ```text
//! Listening   + readable        -> on_accept
//! Connecting  + writable|error  -> on_connect
//! Established + readable|closed -> on_readable
//! Established + writable        -> on_writable
//! ```
//!
//! An error returned by a callback is routed to that channel's
//! [`Channel::on_exception`]; it never stops the loop or touches other
//! channels. The loop exits when the shared [`Lifecycle`] stops, after
//! calling [`Channel::release`] on everything still registered.
//!
//! Channels are `Rc<RefCell<_>>` because the reactor never leaves its thread.
//! Two tokens may share one channel object (the two halves of a TCP tunnel
//! pair); the channel learns which half fired from the token it is given.

pub mod lifecycle;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace, warn};

pub use lifecycle::Lifecycle;

use crate::error::{InterceptorError, ProxyError, Result};

/// Token reserved for the reactor's waker
pub const WAKE_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

/// Shared handle to a channel
pub type ChannelRef = Rc<RefCell<dyn Channel>>;

/// Which readiness callback a channel expects next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// A listening socket waiting for peers
    Listening,
    /// An outbound connect in progress
    Connecting,
    /// A connected socket moving bytes
    Established,
}

/// Readiness flags of one event, detached from the `mio` event buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Callbacks of a socket registered with the reactor
///
/// Every callback defaults to doing nothing.
pub trait Channel {
    /// Phase used to pick the callback for the next readiness event
    fn phase(&self, _token: Token) -> ChannelPhase {
        ChannelPhase::Established
    }

    fn on_accept(&mut self, _token: Token, _ctx: &mut ReactorContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_connect(&mut self, _token: Token, _ctx: &mut ReactorContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_readable(&mut self, _token: Token, _ctx: &mut ReactorContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_writable(&mut self, _token: Token, _ctx: &mut ReactorContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Periodic callback for the reactor's timer channel
    fn on_timer(&mut self, _ctx: &mut ReactorContext<'_>) -> Result<()> {
        Ok(())
    }

    /// A callback of this channel failed
    fn on_exception(&mut self, token: Token, err: &InterceptorError, _ctx: &mut ReactorContext<'_>) {
        warn!(token = token.0, "Channel callback failed: {}", err);
    }

    /// The reactor is shutting down; close owned resources
    fn release(&mut self, _registry: &Registry) {}
}

/// Registration handle passed to channel callbacks
///
/// New channels and detached tokens take effect after the current callback
/// returns.
pub struct ReactorContext<'a> {
    registry: &'a Registry,
    next_token: &'a mut usize,
    attached: Vec<(Token, ChannelRef)>,
    detached: Vec<Token>,
}

impl<'a> ReactorContext<'a> {
    fn new(registry: &'a Registry, next_token: &'a mut usize) -> Self {
        Self {
            registry,
            next_token,
            attached: Vec::new(),
            detached: Vec::new(),
        }
    }

    /// The poll registry, for (re)registering sources
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        self.registry
    }

    /// Allocate a fresh token. Tokens are never reused.
    pub fn next_token(&mut self) -> Token {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        token
    }

    /// Route future events for `token` to `channel`
    pub fn attach(&mut self, token: Token, channel: ChannelRef) {
        self.attached.push((token, channel));
    }

    /// Stop routing events for `token`
    ///
    /// The caller deregisters the source itself.
    pub fn detach(&mut self, token: Token) {
        self.detached.push(token);
    }

    fn into_changes(self) -> (Vec<(Token, ChannelRef)>, Vec<Token>) {
        (self.attached, self.detached)
    }
}

/// Single-threaded readiness loop
pub struct Reactor {
    name: String,
    poll: Poll,
    waker: Arc<Waker>,
    channels: HashMap<Token, ChannelRef>,
    wake_handler: Option<ChannelRef>,
    timer: Option<(Duration, ChannelRef)>,
    next_token: usize,
    lifecycle: Arc<Lifecycle>,
}

impl Reactor {
    /// Create a reactor bound to the proxy lifecycle
    ///
    /// Stopping the lifecycle wakes the reactor so it can exit promptly.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reactor` if the poll instance or waker cannot be
    /// created.
    pub fn new(name: impl Into<String>, lifecycle: Arc<Lifecycle>) -> Result<Self> {
        let poll = Poll::new().map_err(|e| ProxyError::Reactor(e.to_string()))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKE_TOKEN)
                .map_err(|e| ProxyError::Reactor(e.to_string()))?,
        );
        let stop_waker = Arc::clone(&waker);
        lifecycle.on_stop(move || {
            let _ = stop_waker.wake();
        });
        Ok(Self {
            name: name.into(),
            poll,
            waker,
            channels: HashMap::new(),
            wake_handler: None,
            timer: None,
            next_token: WAKE_TOKEN.0 + 1,
            lifecycle,
        })
    }

    /// The poll registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// A waker other threads can use to interrupt the poll
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Allocate a fresh token
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Route events for `token` to `channel`
    pub fn attach(&mut self, token: Token, channel: ChannelRef) {
        self.channels.insert(token, channel);
    }

    /// Channel whose `on_readable` runs whenever the waker fires
    pub fn set_wake_handler(&mut self, channel: ChannelRef) {
        self.wake_handler = Some(channel);
    }

    /// Channel whose `on_timer` runs at most once per `interval`
    pub fn set_timer(&mut self, interval: Duration, channel: ChannelRef) {
        self.timer = Some((interval, channel));
    }

    /// Number of attached channels
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Run until the lifecycle stops
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reactor` if polling fails with a non-transient
    /// error. Channels are released in either case.
    pub fn run(mut self) -> Result<()> {
        debug!(reactor = %self.name, "Reactor started");
        let result = self.run_loop();
        self.release();
        debug!(reactor = %self.name, "Reactor stopped");
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut last_tick = Instant::now();

        while self.lifecycle.is_alive() {
            let timeout = self
                .timer
                .as_ref()
                .map(|(interval, _)| interval.saturating_sub(last_tick.elapsed()));

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(reactor = %self.name, "Poll failed: {}", e);
                return Err(ProxyError::Reactor(e.to_string()).into());
            }

            let ready: Vec<(Token, Readiness)> = events
                .iter()
                .map(|event| (event.token(), Readiness::from_event(event)))
                .collect();

            for (token, readiness) in ready {
                if !self.lifecycle.is_alive() {
                    break;
                }
                if token == WAKE_TOKEN {
                    if let Some(handler) = self.wake_handler.clone() {
                        self.invoke(token, &handler, |ch, t, ctx| ch.on_readable(t, ctx));
                    }
                    continue;
                }
                self.dispatch(token, readiness);
            }

            if let Some((interval, channel)) = self.timer.clone() {
                if last_tick.elapsed() >= interval {
                    last_tick = Instant::now();
                    self.invoke(WAKE_TOKEN, &channel, |ch, _, ctx| ch.on_timer(ctx));
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        let Some(channel) = self.channels.get(&token).cloned() else {
            trace!(reactor = %self.name, token = token.0, "Event for detached token");
            return;
        };
        let phase = channel.borrow().phase(token);
        match phase {
            ChannelPhase::Listening if readiness.readable => {
                self.invoke(token, &channel, |ch, t, ctx| ch.on_accept(t, ctx));
            }
            ChannelPhase::Connecting if readiness.writable || readiness.error || readiness.closed => {
                self.invoke(token, &channel, |ch, t, ctx| ch.on_connect(t, ctx));
            }
            ChannelPhase::Established if readiness.readable || readiness.closed || readiness.error => {
                self.invoke(token, &channel, |ch, t, ctx| ch.on_readable(t, ctx));
            }
            ChannelPhase::Established if readiness.writable => {
                self.invoke(token, &channel, |ch, t, ctx| ch.on_writable(t, ctx));
            }
            _ => {}
        }
    }

    fn invoke<F>(&mut self, token: Token, channel: &ChannelRef, callback: F)
    where
        F: FnOnce(&mut dyn Channel, Token, &mut ReactorContext<'_>) -> Result<()>,
    {
        let mut ctx = ReactorContext::new(self.poll.registry(), &mut self.next_token);
        {
            let mut ch = channel.borrow_mut();
            if let Err(e) = callback(&mut *ch, token, &mut ctx) {
                ch.on_exception(token, &e, &mut ctx);
            }
        }
        let (attached, detached) = ctx.into_changes();
        for token in detached {
            self.channels.remove(&token);
        }
        for (token, channel) in attached {
            self.channels.insert(token, channel);
        }
    }

    fn release(&mut self) {
        let registry = self.poll.registry();
        let mut seen: Vec<*const ()> = Vec::new();
        for channel in self.channels.values() {
            // Tunnel pairs appear under two tokens; release each object once
            let ptr = Rc::as_ptr(channel).cast::<()>();
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            channel.borrow_mut().release(registry);
        }
        for channel in [self.wake_handler.take(), self.timer.take().map(|(_, c)| c)]
            .into_iter()
            .flatten()
        {
            if let Ok(mut ch) = channel.try_borrow_mut() {
                ch.release(registry);
            }
        }
        self.channels.clear();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

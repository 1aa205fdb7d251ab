//! Proxy-wide lifecycle flag
//!
//! Every background loop (dispatcher, TCP shard reactors, the UDP reactor and
//! the async interceptor worker) checks the same flag at each suspension
//! point. Stopping flips the flag once and runs the registered stop hooks,
//! which wake any loop blocked in a readiness poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

type StopHook = Box<dyn FnOnce() + Send>;

/// Shared liveness flag with stop hooks
pub struct Lifecycle {
    alive: AtomicBool,
    hooks: Mutex<Vec<StopHook>>,
}

impl Lifecycle {
    /// Create a live lifecycle
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Whether the proxy is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Run `hook` when the lifecycle stops
    ///
    /// If it has already stopped, the hook runs immediately.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_alive() {
            let mut hooks = self.hooks.lock();
            // Re-check under the lock so a concurrent stop cannot miss the hook
            if self.is_alive() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Stop the proxy. Only the first call has an effect.
    pub fn stop(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock();
            if !self.alive.swap(false, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        debug!(hooks = hooks.len(), "Lifecycle stopping");
        for hook in hooks {
            hook();
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

//! Important events reported to the host
//!
//! Transient failures that a user may want to see (an unreachable remote,
//! for example) are posted as [`ImportantEvent`]s. Listeners are invoked
//! synchronously on the thread that reported the event, so they must not
//! block.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

/// Classification of an important event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSynopsis {
    /// An IPv4 remote could not be reached
    Ipv4Unreachable,
    /// An IPv6 remote could not be reached
    Ipv6Unreachable,
}

impl EventSynopsis {
    /// Synopsis for an unreachable remote of the given IP version
    #[must_use]
    pub const fn unreachable(is_ipv6: bool) -> Self {
        if is_ipv6 {
            Self::Ipv6Unreachable
        } else {
            Self::Ipv4Unreachable
        }
    }
}

impl fmt::Display for EventSynopsis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4Unreachable => f.write_str("IPV4_UNREACHABLE"),
            Self::Ipv6Unreachable => f.write_str("IPV6_UNREACHABLE"),
        }
    }
}

/// An event worth surfacing outside the engine
#[derive(Debug, Clone)]
pub struct ImportantEvent {
    pub message: String,
    pub synopsis: EventSynopsis,
    /// Display form of the underlying error, if any
    pub cause: Option<String>,
}

impl ImportantEvent {
    pub fn new(
        message: impl Into<String>,
        synopsis: EventSynopsis,
        cause: Option<&dyn std::error::Error>,
    ) -> Self {
        Self {
            message: message.into(),
            synopsis,
            cause: cause.map(ToString::to_string),
        }
    }
}

/// Receiver of important events
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ImportantEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ImportantEvent) + Send + Sync,
{
    fn on_event(&self, event: &ImportantEvent) {
        self(event);
    }
}

/// Fan-out of important events to registered listeners
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Log the event and hand it to every listener
    pub fn post(&self, event: &ImportantEvent) {
        warn!(
            synopsis = %event.synopsis,
            cause = event.cause.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );
        for listener in self.listeners.read().iter() {
            listener.on_event(event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_synopsis_by_version() {
        assert_eq!(EventSynopsis::unreachable(false), EventSynopsis::Ipv4Unreachable);
        assert_eq!(EventSynopsis::unreachable(true), EventSynopsis::Ipv6Unreachable);
        assert_eq!(EventSynopsis::Ipv6Unreachable.to_string(), "IPV6_UNREACHABLE");
    }

    #[test]
    fn test_bus_delivers_to_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let bus = EventBus::new();
        bus.add_listener(Arc::new(move |event: &ImportantEvent| {
            sink.lock().push(event.synopsis);
        }));

        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        bus.post(&ImportantEvent::new(
            "connect failed",
            EventSynopsis::Ipv4Unreachable,
            Some(&cause),
        ));

        assert_eq!(*seen.lock(), vec![EventSynopsis::Ipv4Unreachable]);
    }
}

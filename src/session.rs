//! NAT session tracking
//!
//! Correlates the packets of one client flow across the dispatcher thread
//! and the reactor threads.
//!
//! # Design
//!
//! A session is identified by the client's original request:
//! `(source port, destination address, destination port)`. The client
//! source address is always inside the tunnel's own range, so it is not part
//! of the key. Equality and hashing use only these three fields, never
//! identity, because lookups come from independently parsed header views.
//!
//! The store is indexed by source port:
//! - TCP responses arrive at the NAT addressed to the client's source port
//! - the proxy shard sees the same port as the accepted peer port
//! - UDP datagrams are correlated purely by source port
//!
//! # Thread Safety
//!
//! The dispatcher inserts while reactor threads read and remove. The store is
//! a `DashMap`, so there is no unsynchronized access across those threads.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::packet::{IpAddress, Port, Protocol};

/// Correlation key of a NAT session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Client source port
    pub source_port: Port,
    /// Original destination address
    pub destination_address: IpAddress,
    /// Original destination port
    pub destination_port: Port,
}

impl SessionKey {
    /// Create a key from raw parts
    #[must_use]
    pub fn new(source_port: u16, destination_address: IpAddress, destination_port: u16) -> Self {
        Self {
            source_port: Port::new(source_port),
            destination_address,
            destination_port: Port::new(destination_port),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination_address {
            IpAddress::V4(_) => write!(
                f,
                ":{} -> {}:{}",
                self.source_port, self.destination_address, self.destination_port
            ),
            IpAddress::V6(_) => write!(
                f,
                ":{} -> [{}]:{}",
                self.source_port, self.destination_address, self.destination_port
            ),
        }
    }
}

/// A TCP or UDP NAT session
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    protocol: Protocol,
    created_at: Instant,
    last_active: Mutex<Instant>,
}

impl Session {
    fn new(key: SessionKey, protocol: Protocol) -> Self {
        let now = Instant::now();
        Self {
            key,
            protocol,
            created_at: now,
            last_active: Mutex::new(now),
        }
    }

    #[must_use]
    pub const fn key(&self) -> SessionKey {
        self.key
    }

    #[must_use]
    pub const fn source_port(&self) -> Port {
        self.key.source_port
    }

    #[must_use]
    pub const fn destination_address(&self) -> IpAddress {
        self.key.destination_address
    }

    #[must_use]
    pub const fn destination_port(&self) -> Port {
        self.key.destination_port
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Record activity on this session
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.key)
    }
}

/// Concurrent session table indexed by client source port
#[derive(Debug)]
pub struct SessionStore {
    protocol: Protocol,
    sessions: DashMap<Port, Arc<Session>>,
}

impl SessionStore {
    /// Create an empty store for one protocol
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            sessions: DashMap::new(),
        }
    }

    /// Record a client request, returning its session
    ///
    /// An existing session with the same key is reused and touched. A
    /// session with the same source port but a different destination is
    /// replaced (the client reused its ephemeral port).
    pub fn insert(
        &self,
        source_port: u16,
        destination_address: IpAddress,
        destination_port: u16,
    ) -> Arc<Session> {
        let key = SessionKey::new(source_port, destination_address, destination_port);
        let mut entry = self
            .sessions
            .entry(key.source_port)
            .or_insert_with(|| Arc::new(Session::new(key, self.protocol)));
        if entry.key != key {
            *entry = Arc::new(Session::new(key, self.protocol));
        } else {
            entry.touch();
        }
        Arc::clone(entry.value())
    }

    /// Look up the session owning a client source port
    #[must_use]
    pub fn query(&self, source_port: u16) -> Option<Arc<Session>> {
        self.sessions
            .get(&Port::new(source_port))
            .map(|s| Arc::clone(s.value()))
    }

    /// Remove a session if it is still the one registered for its port
    pub fn remove(&self, session: &Session) -> bool {
        self.sessions
            .remove_if(&session.key.source_port, |_, current| current.key == session.key)
            .is_some()
    }

    /// Remove sessions idle for longer than `max_idle`, returning how many
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.idle_time() <= max_idle);
        before.saturating_sub(self.sessions.len())
    }

    /// Protocol this store tracks
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session
    pub fn clear(&self) {
        self.sessions.clear();
    }
}

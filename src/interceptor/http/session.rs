//! Logical HTTP records of a relayed TCP connection
//!
//! An [`HttpSession`] is created lazily when the first byte of a TCP session
//! reaches the HTTP bridge and is dropped once both directions finished.
//! Its request and response records are filled progressively: the TLS sniff
//! stage sets the https and plaintext flags, the header parser fills method,
//! host, path and headers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::packet::IpAddress;
use crate::session::{Session, SessionKey};

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);
static RESPONSE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Request side of an HTTP exchange
#[derive(Debug, Clone, Serialize)]
pub struct HttpRequest {
    /// Process-wide creation order
    pub sequence: u64,
    /// Milliseconds since the Unix epoch at session creation
    pub request_time: Option<u64>,
    pub source_port: Option<u16>,
    pub destination_address: Option<IpAddress>,
    pub destination_port: Option<u16>,
    pub method: Option<String>,
    /// `Some(true)` for TLS, `Some(false)` for plaintext HTTP, `None` if
    /// the stream is neither
    pub is_https: Option<bool>,
    pub http_version: Option<String>,
    /// Host used to create TLS engines (SNI, `Host` header or destination address)
    pub(crate) host_hint: Option<String>,
    /// The buffers seen by interceptors are plaintext (decrypted, or never
    /// encrypted)
    pub(crate) is_plaintext: Option<bool>,
    /// `Host` header value
    pub host: Option<String>,
    pub path: Option<String>,
    /// Raw request text of the first buffer
    pub origin_head: Option<String>,
    /// Non-blank header lines, request line first
    pub format_head: Option<Vec<String>>,
}

impl HttpRequest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            request_time: None,
            source_port: None,
            destination_address: None,
            destination_port: None,
            method: None,
            is_https: None,
            http_version: None,
            host_hint: None,
            is_plaintext: None,
            host: None,
            path: None,
            origin_head: None,
            format_head: None,
        }
    }

    /// Full URL, when the scheme, host and path are all known
    #[must_use]
    pub fn url(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let path = self.path.as_deref()?;
        let scheme = if self.is_https? { "https" } else { "http" };
        Some(format!("{scheme}://{host}{path}"))
    }

    /// Whether buffers reaching interceptors are readable HTTP
    #[must_use]
    pub const fn is_plaintext(&self) -> Option<bool> {
        self.is_plaintext
    }

    /// Host name used for TLS engine creation
    #[must_use]
    pub fn host_hint(&self) -> Option<&str> {
        self.host_hint.as_deref()
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Response side of an HTTP exchange
#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    pub sequence: u64,
    pub request_time: Option<u64>,
    pub source_port: Option<u16>,
    pub destination_address: Option<IpAddress>,
    pub destination_port: Option<u16>,
    /// URL of the matching request
    pub url: Option<String>,
    pub is_https: Option<bool>,
    pub http_version: Option<String>,
    /// Status code as sent on the status line
    pub status: Option<String>,
    pub(crate) host_hint: Option<String>,
    pub(crate) is_plaintext: Option<bool>,
    pub origin_head: Option<String>,
    pub format_head: Option<Vec<String>>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl HttpResponse {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: RESPONSE_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            request_time: None,
            source_port: None,
            destination_address: None,
            destination_port: None,
            url: None,
            is_https: None,
            http_version: None,
            status: None,
            host_hint: None,
            is_plaintext: None,
            origin_head: None,
            format_head: None,
            content_type: None,
            content_encoding: None,
        }
    }

    #[must_use]
    pub const fn is_plaintext(&self) -> Option<bool> {
        self.is_plaintext
    }

    #[must_use]
    pub fn host_hint(&self) -> Option<&str> {
        self.host_hint.as_deref()
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// Request and response records bound to one TCP session
///
/// Shared between the shard's reactor thread and the async interceptor
/// worker, so each record sits behind its own lock.
pub struct HttpSession {
    request: Mutex<HttpRequest>,
    response: Mutex<HttpResponse>,
    tcp_session: Arc<Session>,
}

impl HttpSession {
    /// Create the records for a TCP session, stamped with its addressing
    #[must_use]
    pub fn new(tcp_session: Arc<Session>) -> Self {
        let request_time = Some(now_millis());
        let key = tcp_session.key();

        let mut request = HttpRequest::new();
        request.request_time = request_time;
        request.source_port = Some(key.source_port.get());
        request.destination_address = Some(key.destination_address);
        request.destination_port = Some(key.destination_port.get());

        let mut response = HttpResponse::new();
        response.request_time = request_time;
        response.source_port = Some(key.source_port.get());
        response.destination_address = Some(key.destination_address);
        response.destination_port = Some(key.destination_port.get());

        Self {
            request: Mutex::new(request),
            response: Mutex::new(response),
            tcp_session,
        }
    }

    /// Lock the request record
    pub fn request(&self) -> MutexGuard<'_, HttpRequest> {
        self.request.lock()
    }

    /// Lock the response record
    pub fn response(&self) -> MutexGuard<'_, HttpResponse> {
        self.response.lock()
    }

    /// Snapshot of the request record
    #[must_use]
    pub fn request_snapshot(&self) -> HttpRequest {
        self.request.lock().clone()
    }

    /// Snapshot of the response record
    #[must_use]
    pub fn response_snapshot(&self) -> HttpResponse {
        self.response.lock().clone()
    }

    #[must_use]
    pub const fn tcp_session(&self) -> &Arc<Session> {
        &self.tcp_session
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.tcp_session.key()
    }
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("key", &self.tcp_session.key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;
    use crate::session::SessionStore;

    #[test]
    fn test_url_requires_scheme_host_path() {
        let mut request = HttpRequest::new();
        assert_eq!(request.url(), None);

        request.host = Some("example.com".into());
        request.path = Some("/index.html".into());
        assert_eq!(request.url(), None);

        request.is_https = Some(false);
        assert_eq!(request.url().as_deref(), Some("http://example.com/index.html"));

        request.is_https = Some(true);
        assert_eq!(request.url().as_deref(), Some("https://example.com/index.html"));
    }

    #[test]
    fn test_sequence_increases() {
        let a = HttpRequest::new();
        let b = HttpRequest::new();
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_session_stamps_addressing() {
        let store = SessionStore::new(Protocol::Tcp);
        let tcp = store.insert(40000, "93.184.216.34".parse().expect("Should parse"), 443);
        let http = HttpSession::new(Arc::clone(&tcp));

        let request = http.request_snapshot();
        assert_eq!(request.source_port, Some(40000));
        assert_eq!(request.destination_port, Some(443));
        assert_eq!(
            request.destination_address.map(|a| a.to_string()).as_deref(),
            Some("93.184.216.34")
        );
        let response = http.response_snapshot();
        assert_eq!(response.request_time, request.request_time);
        assert_eq!(http.key(), tcp.key());
    }
}

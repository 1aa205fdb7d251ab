//! Error types for tun-interceptor
//!
//! This module defines the error hierarchy for the interception engine.
//! Errors are grouped by subsystem and carry a recovery hint: a recoverable
//! error aborts only the packet, buffer or session that raised it, while a
//! non-recoverable one ends the loop that observed it.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for tun-interceptor
#[derive(Debug, Error)]
pub enum InterceptorError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or unsupported packets
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// NAT session correlation errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// TLS interception errors
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Proxy server and tunnel errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl InterceptorError {
    /// Check if this error only affects the current work item
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Packet(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Tls(e) => e.is_recoverable(),
            Self::Proxy(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Packet parsing errors
///
/// All of these mean "drop the frame and keep reading".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Frame shorter than the minimum header for its IP version
    #[error("Packet too short: {len} bytes (minimum {min} required)")]
    TooShort { len: usize, min: usize },

    /// IP version nibble is neither 4 nor 6
    #[error("Unknown IP version: {0}")]
    UnknownVersion(u8),

    /// Protocol code has no interceptor
    #[error("Unsupported protocol code: {0}")]
    UnsupportedProtocol(u8),

    /// Header length field points past the end of the frame
    #[error("Header length {header_len} exceeds packet length {len}")]
    HeaderOverflow { header_len: usize, len: usize },

    /// An IPv4 address was written into an IPv6 header or vice versa
    #[error("Address family mismatch: expected IPv{expected}")]
    AddressFamilyMismatch { expected: u8 },
}

impl PacketError {
    /// Malformed packets never stop the dispatcher
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// NAT session errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No session is registered for the given port
    #[error("No {protocol} session for port {port}")]
    NotFound { protocol: &'static str, port: u16 },
}

impl SessionError {
    /// A missing session aborts the current packet only
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a not found error
    #[must_use]
    pub const fn not_found(protocol: &'static str, port: u16) -> Self {
        Self::NotFound { protocol, port }
    }
}

/// TLS interception errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// Engine could not be created for the session
    #[error("Failed to create {role} TLS engine for {host}")]
    EngineCreation { role: &'static str, host: String },

    /// Encode was requested before the engine existed
    #[error("No TLS engine bound to session {0}")]
    EngineMissing(String),

    /// The TLS library rejected a record
    #[error("TLS protocol failure: {0}")]
    Protocol(String),

    /// I/O error while moving records through the engine
    #[error("TLS I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TlsError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::EngineCreation { .. } => true,
            Self::EngineMissing(_) => true,
            Self::Protocol(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create an engine creation error
    pub fn engine_creation(role: &'static str, host: impl Into<String>) -> Self {
        Self::EngineCreation {
            role,
            host: host.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Proxy server and tunnel errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind a proxy listener or datagram socket
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Host refused to exclude the socket from the virtual interface
    #[error("Failed to protect socket to {remote}: {reason}")]
    ProtectFailed { remote: SocketAddr, reason: String },

    /// Connection to the real remote failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    /// Reactor could not be created or polled
    #[error("Reactor error: {0}")]
    Reactor(String),

    /// Interceptor failed while handling a buffer
    #[error("Interceptor failed: {0}")]
    Interceptor(String),

    /// Write to a tunnel pair that has already closed
    #[error("Tunnel closed")]
    TunnelClosed,

    /// I/O error
    #[error("Proxy I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::ProtectFailed { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::Reactor(_) => false,
            Self::Interceptor(_) => true,
            Self::TunnelClosed => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create an interceptor error
    pub fn interceptor(msg: impl Into<String>) -> Self {
        Self::Interceptor(msg.into())
    }
}

/// Type alias for Result with `InterceptorError`
pub type Result<T> = std::result::Result<T, InterceptorError>;

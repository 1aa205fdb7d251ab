//! Configuration types for tun-interceptor
//!
//! Everything here is plain data loaded from JSON. Interceptor factories,
//! the socket protector and TLS material are not serializable and are handed
//! to [`InterceptionProxy`](crate::proxy::InterceptionProxy) directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::packet::IpAddress;

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Largest frame read from or written to the tunnel device
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// IPv4 address of the tunnel interface
    #[serde(default = "default_proxy_address")]
    pub proxy_address: IpAddress,

    /// IPv6 address of the tunnel interface
    #[serde(default = "default_ipv6_proxy_address")]
    pub ipv6_proxy_address: IpAddress,

    /// Hand IPv6 frames to the interceptors (otherwise skipped)
    #[serde(default)]
    pub enable_ipv6: bool,

    /// Number of TCP proxy shards, each with its own reactor
    #[serde(default = "default_tcp_proxy_server_count")]
    pub tcp_proxy_server_count: usize,

    /// Optional TCP bandwidth shaping
    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    /// UDP relay settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// Capacity of the offloaded HTTP interceptor queue
    #[serde(default = "default_async_queue_capacity")]
    pub async_queue_capacity: usize,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl ProxyConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::ValidationError(format!(
                "mtu must be between {MIN_MTU} and {MAX_MTU}, got {}",
                self.mtu
            )));
        }

        if !self.proxy_address.is_ipv4() {
            return Err(ConfigError::ValidationError(format!(
                "proxy_address must be IPv4, got {}",
                self.proxy_address
            )));
        }

        if !self.ipv6_proxy_address.is_ipv6() {
            return Err(ConfigError::ValidationError(format!(
                "ipv6_proxy_address must be IPv6, got {}",
                self.ipv6_proxy_address
            )));
        }

        if self.tcp_proxy_server_count == 0 {
            return Err(ConfigError::ValidationError(
                "tcp_proxy_server_count must be greater than 0".into(),
            ));
        }

        if self.async_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "async_queue_capacity must be greater than 0".into(),
            ));
        }

        self.bandwidth.validate()?;
        self.udp.validate()?;
        self.log.validate()?;

        Ok(())
    }

    /// Tunnel address matching the IP version of `addr`
    #[must_use]
    pub const fn tunnel_address_for(&self, addr: &IpAddress) -> IpAddress {
        match addr {
            IpAddress::V4(_) => self.proxy_address,
            IpAddress::V6(_) => self.ipv6_proxy_address,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            proxy_address: default_proxy_address(),
            ipv6_proxy_address: default_ipv6_proxy_address(),
            enable_ipv6: false,
            tcp_proxy_server_count: default_tcp_proxy_server_count(),
            bandwidth: BandwidthConfig::default(),
            udp: UdpConfig::default(),
            async_queue_capacity: default_async_queue_capacity(),
            log: LogConfig::default(),
        }
    }
}

/// TCP bandwidth shaping
///
/// Unset limits disable shaping for that direction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BandwidthConfig {
    /// Client-to-internet limit in KB/s
    #[serde(default)]
    pub request_limit_kbps: Option<u64>,

    /// Internet-to-client limit in KB/s
    #[serde(default)]
    pub response_limit_kbps: Option<u64>,

    /// Queued packets older than this are dropped
    #[serde(default)]
    pub stale_timeout_ms: Option<u64>,
}

impl BandwidthConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limit) in [
            ("request_limit_kbps", self.request_limit_kbps),
            ("response_limit_kbps", self.response_limit_kbps),
        ] {
            if limit == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "bandwidth.{name} must be greater than 0 when set"
                )));
            }
        }
        Ok(())
    }

    /// Whether any direction is shaped
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.request_limit_kbps.is_some() || self.response_limit_kbps.is_some()
    }

    #[must_use]
    pub fn stale_timeout(&self) -> Option<Duration> {
        self.stale_timeout_ms.map(Duration::from_millis)
    }
}

/// UDP relay settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Evict relay sockets idle for longer than this (unset: never)
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl UdpConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "udp.idle_timeout_secs must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unknown levels or formats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown log level: {other}"
                )))
            }
        }
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format: {other}"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 65535;

const fn default_mtu() -> usize {
    10000
}

const fn default_proxy_address() -> IpAddress {
    // 10.1.10.1
    IpAddress::V4(0x0A01_0A01)
}

const fn default_ipv6_proxy_address() -> IpAddress {
    // a:a:a:a:a:a:a:a
    IpAddress::V6(0x000a_000a_000a_000a_000a_000a_000a_000a)
}

const fn default_tcp_proxy_server_count() -> usize {
    1
}

const fn default_async_queue_capacity() -> usize {
    1024
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

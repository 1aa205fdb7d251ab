//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::ProxyConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: ProxyConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: mtu={}, tcp_servers={}, ipv6={}",
        config.mtu, config.tcp_proxy_server_count, config.enable_ipv6
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_INTERCEPTOR_MTU`: Override MTU
/// - `TUN_INTERCEPTOR_LOG_LEVEL`: Override log level
/// - `TUN_INTERCEPTOR_ENABLE_IPV6`: Override IPv6 handling (`true`/`false`)
/// - `TUN_INTERCEPTOR_TCP_SERVERS`: Override TCP proxy shard count
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut ProxyConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(mtu) = lookup("TUN_INTERCEPTOR_MTU") {
        config.mtu = mtu.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_INTERCEPTOR_MTU".into(),
            reason: format!("Invalid number: {mtu}"),
        })?;
        debug!("MTU overridden to {}", config.mtu);
    }

    if let Some(level) = lookup("TUN_INTERCEPTOR_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(flag) = lookup("TUN_INTERCEPTOR_ENABLE_IPV6") {
        config.enable_ipv6 = flag.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_INTERCEPTOR_ENABLE_IPV6".into(),
            reason: format!("Invalid boolean: {flag}"),
        })?;
        debug!("IPv6 handling overridden to {}", config.enable_ipv6);
    }

    if let Some(count) = lookup("TUN_INTERCEPTOR_TCP_SERVERS") {
        config.tcp_proxy_server_count = count.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_INTERCEPTOR_TCP_SERVERS".into(),
            reason: format!("Invalid number: {count}"),
        })?;
        debug!(
            "TCP proxy server count overridden to {}",
            config.tcp_proxy_server_count
        );
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = ProxyConfig::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}

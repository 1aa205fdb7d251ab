//! Configuration module for tun-interceptor
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tun_interceptor::config::{load_config, ProxyConfig};
//!
//! let config = load_config("/data/local/tmp/interceptor.json").unwrap();
//! println!("MTU: {}", config.mtu);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{BandwidthConfig, LogConfig, ProxyConfig, UdpConfig};

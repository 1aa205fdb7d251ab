//! Configuration loading from files

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tun_interceptor::config::{create_default_config, load_config};
use tun_interceptor::dispatcher::TunDevice;
use tun_interceptor::error::ConfigError;
use tun_interceptor::proxy::InterceptionProxy;
use tun_interceptor::IpAddress;

use super::MemoryTun;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Should create temp file");
    file.write_all(json.as_bytes()).expect("Should write config");
    file.flush().expect("Should flush config");
    file
}

#[test]
fn test_loaded_config_starts_proxy() {
    let file = write_config(
        r#"{
            "mtu": 1500,
            "proxy_address": "10.8.0.1",
            "tcp_proxy_server_count": 2,
            "udp": { "idle_timeout_secs": 30 },
            "log": { "level": "debug", "format": "json" }
        }"#,
    );
    let config = load_config(file.path()).expect("Should load config");
    assert_eq!(config.mtu, 1500);
    assert_eq!(config.proxy_address, "10.8.0.1".parse::<IpAddress>().expect("Should parse"));
    assert_eq!(config.udp.idle_timeout_secs, Some(30));
    assert!(!config.bandwidth.is_enabled());

    let tun: Arc<dyn TunDevice> = MemoryTun::new();
    let handle = InterceptionProxy::new(config).start(tun).expect("Should start");
    assert_eq!(handle.shard_ports().len(), 2);
    assert_eq!(handle.context().config().mtu, 1500);

    handle.stop();
    handle.join().expect("Should stop cleanly");
}

#[test]
fn test_default_config_file_round_trip() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let path = dir.path().join("config.json");
    create_default_config(&path).expect("Should write default config");

    let config = load_config(&path).expect("Should load default config");
    assert_eq!(config.mtu, 10000);
    assert_eq!(config.tcp_proxy_server_count, 1);
    assert!(!config.enable_ipv6);
    assert!(config.udp.idle_timeout_secs.is_none());
}

#[test]
fn test_invalid_file_rejected() {
    let file = write_config(r#"{ "mtu": 100 }"#);
    let err = load_config(file.path()).expect_err("Should reject tiny MTU");
    assert!(matches!(err, ConfigError::ValidationError(_)));

    let file = write_config("{ not json");
    let err = load_config(file.path()).expect_err("Should reject malformed JSON");
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn test_shaping_enabled_from_file() {
    let file = write_config(
        r#"{
            "bandwidth": { "request_limit_kbps": 512, "stale_timeout_ms": 2000 }
        }"#,
    );
    let config = load_config(file.path()).expect("Should load config");
    assert!(config.bandwidth.is_enabled());

    let tun: Arc<dyn TunDevice> = MemoryTun::new();
    let handle = InterceptionProxy::new(config).start(tun).expect("Should start with shaper");
    handle.stop();
    handle.join().expect("Should stop cleanly");
}

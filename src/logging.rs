//! Logging initialization
//!
//! The engine logs through `tracing` everywhere. Hosts that already install a
//! subscriber can skip this; a second installation is ignored.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install a global fmt subscriber for the given log configuration
///
/// `RUST_LOG` directives are honoured on top of the configured level.
/// Returns `false` if a global subscriber was already set.
pub fn init_logging(config: &LogConfig) -> bool {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target)
        .with_thread_names(true);

    if config.format == "json" {
        subscriber.json().try_init().is_ok()
    } else {
        subscriber.try_init().is_ok()
    }
}

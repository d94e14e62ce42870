//! Logging setup.
//!
//! The library only emits `tracing` events. Applications that want a
//! subscriber can call [`init_telemetry`].

#[cfg(feature = "telemetry")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::QueueResult;
use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether to install a subscriber at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Filter directives used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Include the event target.
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_filter() -> String {
    "info,queue_hub=debug".to_string()
}

fn default_with_target() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            filter: default_filter(),
            json: false,
            with_target: default_with_target(),
        }
    }
}

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. A subscriber that is
/// already installed is left in place.
#[cfg(feature = "telemetry")]
pub fn init_telemetry(config: &TelemetryConfig) -> QueueResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| {
            crate::error::QueueError::Configuration(format!("Invalid log filter: {}", e))
        })?;

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init()
    };

    match result {
        Ok(()) => tracing::info!(json = config.json, "Telemetry initialized"),
        Err(e) => tracing::debug!(error = %e, "Subscriber already installed"),
    }

    Ok(())
}

/// Placeholder for when telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn init_telemetry(_config: &TelemetryConfig) -> QueueResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.filter, "info,queue_hub=debug");
        assert!(!config.json);
        assert!(config.with_target);
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = TelemetryConfig::default();
        assert!(init_telemetry(&config).is_ok());
        assert!(init_telemetry(&config).is_ok());
    }

    #[test]
    fn test_disabled_is_noop() {
        let config = TelemetryConfig {
            enabled: false,
            ..TelemetryConfig::default()
        };
        assert!(init_telemetry(&config).is_ok());
    }
}

//! Configuration loader with layered sources.

use crate::config::HubConfig;
use crate::error::{QueueError, QueueResult};
use crate::registry::DriverKind;
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable naming the active environment.
pub const ENVIRONMENT_VAR: &str = "QUEUE_HUB_ENVIRONMENT";

/// Prefix for environment overrides, e.g. `QUEUE_HUB__WORKER__CONCURRENCY`.
pub const ENV_PREFIX: &str = "QUEUE_HUB";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<HubConfig>>,
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `{dir}/default.toml`
    /// 2. `{dir}/{environment}.toml`
    /// 3. `{dir}/local.toml`
    /// 4. Environment variables with the `QUEUE_HUB__` prefix
    pub fn new(config_dir: impl Into<PathBuf>) -> QueueResult<Self> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from `./config`.
    pub fn from_default_location() -> QueueResult<Self> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> HubConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk. The old value is kept on error.
    pub async fn reload(&self) -> QueueResult<()> {
        let new_config = Self::load_config(&self.config_dir)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &Path) -> QueueResult<HubConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        info!(environment = %environment, dir = %config_dir.display(), "Loading configuration");

        let mut builder = Config::builder();
        for layer in ["default", environment.as_str(), "local"] {
            let path = config_dir.join(format!("{}.toml", layer));
            if path.exists() {
                debug!(path = %path.display(), "Loading config file");
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: HubConfig = builder.build()?.try_deserialize()?;
        validate_config(&config)?;
        Ok(config)
    }
}

/// Checks settings that would otherwise fail later at queue or worker creation.
pub fn validate_config(config: &HubConfig) -> QueueResult<()> {
    if config.worker.concurrency == 0 {
        return Err(QueueError::Configuration(
            "worker.concurrency must be at least 1".to_string(),
        ));
    }
    if config.worker.polling_interval_ms == 0 {
        return Err(QueueError::Configuration(
            "worker.polling_interval_ms must be at least 1".to_string(),
        ));
    }
    if config.worker.fetch_limit == 0 {
        return Err(QueueError::Configuration(
            "worker.fetch_limit must be at least 1".to_string(),
        ));
    }

    for (name, queue) in &config.queues {
        if config.driver == DriverKind::ManagedQueue
            && queue.queue_id.as_deref().map_or(true, |id| id.trim().is_empty())
        {
            return Err(QueueError::Configuration(format!(
                "queue '{}' requires queue_id for the managed-queue driver",
                name
            )));
        }
        queue.default_job_options.validate().map_err(|e| {
            QueueError::Configuration(format!("queue '{}' default options: {}", name, e))
        })?;
    }

    Ok(())
}

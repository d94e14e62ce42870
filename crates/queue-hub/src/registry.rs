//! Driver selection.
//!
//! Each driver contributes a [`QueueFactory`]. A [`DriverRegistry`] is built
//! explicitly by the application and maps a [`DriverKind`] to its factory.

use crate::config::{HubConfig, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;
use crate::worker::{JobHandler, Worker, WorkerOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Queue driver identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// In-process memory storage.
    #[default]
    Local,
    /// External managed queueing service.
    ManagedQueue,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Local => "local",
            DriverKind::ManagedQueue => "managed-queue",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DriverKind::Local),
            "managed-queue" | "managed_queue" => Ok(DriverKind::ManagedQueue),
            other => Err(QueueError::UnsupportedDriver {
                driver: other.to_string(),
                available: "local, managed-queue".to_string(),
            }),
        }
    }
}

/// Builds queues and workers for one driver.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    fn driver(&self) -> DriverKind;

    /// Returns the queue called `name`, creating it on first use.
    async fn create_queue(&self, name: &str, config: &QueueConfig) -> QueueResult<Queue>;

    /// Creates a worker over the queue called `name`. The worker is not started.
    async fn create_worker(
        &self,
        name: &str,
        config: &QueueConfig,
        handler: JobHandler,
        options: WorkerOptions,
    ) -> QueueResult<Worker> {
        let queue = self.create_queue(name, config).await?;
        Worker::new(queue, handler, options)
    }
}

/// Maps driver kinds to factories.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<DriverKind, Arc<dyn QueueFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any earlier one for the same driver.
    pub fn register(mut self, factory: Arc<dyn QueueFactory>) -> Self {
        debug!(driver = %factory.driver(), "Registered queue driver");
        self.factories.insert(factory.driver(), factory);
        self
    }

    /// Looks up a factory.
    pub fn factory(&self, driver: DriverKind) -> QueueResult<Arc<dyn QueueFactory>> {
        self.factories
            .get(&driver)
            .cloned()
            .ok_or_else(|| QueueError::UnsupportedDriver {
                driver: driver.to_string(),
                available: self
                    .drivers()
                    .iter()
                    .map(DriverKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Registered drivers, sorted.
    pub fn drivers(&self) -> Vec<DriverKind> {
        let mut drivers: Vec<_> = self.factories.keys().copied().collect();
        drivers.sort();
        drivers
    }

    /// Creates a queue using the configured driver and per-queue settings.
    pub async fn create_queue(&self, config: &HubConfig, name: &str) -> QueueResult<Queue> {
        let factory = self.factory(config.driver)?;
        factory.create_queue(name, &config.queue(name)).await
    }

    /// Creates an unstarted worker using the configured driver and worker settings.
    pub async fn create_worker(
        &self,
        config: &HubConfig,
        name: &str,
        handler: JobHandler,
    ) -> QueueResult<Worker> {
        let factory = self.factory(config.driver)?;
        factory
            .create_worker(name, &config.queue(name), handler, WorkerOptions::from(&config.worker))
            .await
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers())
            .finish()
    }
}

//! Queue hub configuration.

use crate::options::JobOptions;
use crate::registry::DriverKind;
use crate::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    /// Driver used for every queue.
    #[serde(default)]
    pub driver: DriverKind,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Redis connection for the managed-queue client.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker defaults.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-queue settings keyed by queue name.
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
}

impl HubConfig {
    /// Settings for `name`, or defaults when the queue is not configured.
    pub fn queue(&self, name: &str) -> QueueConfig {
        self.queues.get(name).cloned().unwrap_or_default()
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "queue-hub".to_string()
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs started per tick.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Tick interval in milliseconds.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,

    /// How long fetched messages stay hidden, in seconds.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Messages requested per fetch.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            polling_interval_ms: default_polling_interval(),
            visibility_timeout_secs: default_visibility_timeout(),
            fetch_limit: default_fetch_limit(),
        }
    }
}

impl WorkerConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_polling_interval() -> u64 {
    1000
}

fn default_visibility_timeout() -> u64 {
    30
}

fn default_fetch_limit() -> usize {
    20
}

/// Per-queue configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Remote queue identifier; required by the managed-queue driver.
    #[serde(default)]
    pub queue_id: Option<String>,

    /// Options merged under every job added to the queue.
    #[serde(default)]
    pub default_job_options: JobOptions,
}

//! Queue Hub - Driver-Agnostic Job Queue
//!
//! One producer/worker API over interchangeable storage drivers:
//! - `local`: in-process memory storage
//! - `managed-queue`: an external managed queueing service reached through a
//!   [`MessageClient`](managed::MessageClient), with a Redis-backed client
//!   included
//!
//! Workers poll their queue on a fixed interval, order ready jobs by priority
//! and LIFO/FIFO, run them with an optional per-attempt timeout and retry
//! failures with fixed or exponential backoff.
//!
//! # Architecture
//!
//! ```text
//!  Producer ──► Queue ──► Transport ◄── Worker ──► handler
//!                 │      ┌────┴─────┐     │
//!                 │      │          │     │
//!              events  Memory   Managed  events
//!                               │
//!                          MessageClient
//!                          (Redis, ...)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_hub::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = DriverRegistry::new().register(Arc::new(LocalQueueFactory::new()));
//! let config = HubConfig::default();
//!
//! let queue = registry.create_queue(&config, "emails").await?;
//! queue
//!     .add("send", serde_json::json!({"to": "a@b.c"}), Some(JobOptions::new().attempts(3)))
//!     .await?;
//!
//! let worker = registry
//!     .create_worker(&config, "emails", handler_fn(|job| async move {
//!         Ok(serde_json::json!({"sent": job.data()["to"]}))
//!     }))
//!     .await?;
//! worker.start()?;
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod ledger;
pub mod loader;
pub mod local;
pub mod managed;
pub mod metrics;
pub mod options;
pub mod queue;
pub mod registry;
pub mod scheduling;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use config::{HubConfig, QueueConfig, RedisConfig, WorkerConfig};
pub use error::{QueueError, QueueResult};
pub use job::{Job, JobId, JobRecord, JobSnapshot, JobState, JobStatus};
pub use loader::ConfigLoader;
pub use local::{LocalQueueFactory, MemoryTransport};
pub use managed::{ManagedQueueFactory, ManagedTransport, MessageClient, RedisMessageClient};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use options::{Backoff, BackoffKind, JobOptions, RemovalPolicy, StoredJobOptions};
pub use queue::{Queue, QueueEvent};
pub use registry::{DriverKind, DriverRegistry, QueueFactory};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use transport::{JobCounts, Transport};
pub use worker::{handler_fn, JobHandler, Worker, WorkerEvent, WorkerOptions, WorkerStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::job::{Job, JobState};
    pub use crate::local::LocalQueueFactory;
    pub use crate::managed::ManagedQueueFactory;
    pub use crate::options::{Backoff, JobOptions};
    pub use crate::queue::{Queue, QueueEvent};
    pub use crate::registry::DriverRegistry;
    pub use crate::worker::{handler_fn, Worker, WorkerEvent, WorkerOptions};
    pub use crate::{QueueError, QueueResult};
}

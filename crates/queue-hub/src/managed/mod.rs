//! Driver over an external managed queueing service.

mod client;
mod redis_store;
mod transport;

pub use redis_store::{create_pool, make_receipt, receipt_message_id, ManagedKeys, RedisMessageClient};
pub use client::{MessageClient, MessageStats, OutgoingMessage, ReceivedMessage};
pub use transport::{
    decode_message, encode_message, ManagedTransport, DEFAULT_CHANNEL, METADATA_CHANNEL,
    METADATA_OPTIONS, PEEK_LIMIT,
};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;
use crate::registry::{DriverKind, QueueFactory};
use async_trait::async_trait;
use deadpool_redis::Pool;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Opens a client for a queue id.
pub type ClientConnector =
    Arc<dyn Fn(String) -> BoxFuture<'static, QueueResult<Arc<dyn MessageClient>>> + Send + Sync>;

/// Factory for managed-queue backed queues.
///
/// Every queue needs a `queue_id` naming the remote queue.
pub struct ManagedQueueFactory {
    connect: ClientConnector,
    queues: Mutex<HashMap<String, Queue>>,
}

impl ManagedQueueFactory {
    /// Creates a factory that opens clients with `connect`.
    pub fn new<F, Fut>(connect: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<Arc<dyn MessageClient>>> + Send + 'static,
    {
        Self {
            connect: Arc::new(move |queue_id| Box::pin(connect(queue_id))),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a factory whose clients share one Redis pool.
    pub fn redis(pool: Pool, key_prefix: impl Into<String>) -> Self {
        let key_prefix = key_prefix.into();
        Self::new(move |queue_id| {
            let client: Arc<dyn MessageClient> =
                Arc::new(RedisMessageClient::new(pool.clone(), &key_prefix, &queue_id));
            async move { Ok(client) }
        })
    }
}

#[async_trait]
impl QueueFactory for ManagedQueueFactory {
    fn driver(&self) -> DriverKind {
        DriverKind::ManagedQueue
    }

    async fn create_queue(&self, name: &str, config: &QueueConfig) -> QueueResult<Queue> {
        let cached = self.queues.lock().get(name).cloned();
        if let Some(queue) = cached {
            return Ok(queue);
        }

        let queue_id = config
            .queue_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                QueueError::Configuration(format!(
                    "queue_id is required for the managed-queue driver (queue '{}')",
                    name
                ))
            })?
            .to_string();

        let client = (self.connect)(queue_id.clone()).await?;
        let transport = Arc::new(ManagedTransport::new(name, queue_id.clone(), client));
        let queue = Queue::new(name, transport, config.default_job_options.clone())?;

        info!(queue = %name, queue_id = %queue_id, driver = %DriverKind::ManagedQueue, "Created queue");
        Ok(self
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert(queue)
            .clone())
    }
}

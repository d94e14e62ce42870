//! Contract of an external managed queueing service.

use crate::error::QueueResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Message to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Public message id; the service rejects duplicates with `DuplicateJob`.
    pub id: String,
    /// Base64-encoded body.
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// Message as delivered by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
    /// Opaque handle for delete and visibility changes; changes per delivery.
    pub receipt: String,
    pub delivery_count: u32,
}

/// Approximate queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStats {
    /// Messages deliverable now.
    pub visible: u64,
    /// Messages hidden by an outstanding visibility window.
    pub in_flight: u64,
}

/// Network client for a managed queue.
///
/// Delivery is at-least-once and stats may lag; callers must tolerate both.
#[async_trait]
pub trait MessageClient: Send + Sync {
    async fn put_message(&self, message: OutgoingMessage) -> QueueResult<()>;

    /// Fetches up to `limit` visible messages and hides them for `visibility`.
    ///
    /// A zero `visibility` peeks without hiding or counting a delivery.
    async fn get_messages(&self, limit: usize, visibility: Duration) -> QueueResult<Vec<ReceivedMessage>>;

    /// Deletes a message. Succeeds if it is already gone.
    async fn delete_message(&self, receipt: &str) -> QueueResult<()>;

    /// Makes a hidden message visible again at `visible_at` (epoch ms).
    async fn change_visibility(&self, receipt: &str, visible_at: i64) -> QueueResult<()>;

    async fn stats(&self) -> QueueResult<MessageStats>;

    /// Deletes every message.
    async fn purge(&self) -> QueueResult<()>;

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

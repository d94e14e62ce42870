//! Common test infrastructure for driver and worker integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use queue_hub::managed::{
    make_receipt, receipt_message_id, ManagedTransport, MessageClient, MessageStats,
    OutgoingMessage, ReceivedMessage,
};
use queue_hub::scheduling::now_ms;
use queue_hub::{JobOptions, Queue, QueueError, QueueResult, WorkerOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct StoredMessage {
    seq: u64,
    content: String,
    metadata: HashMap<String, String>,
    visible_at: i64,
    deliveries: u32,
}

/// In-process stand-in for a managed queueing service.
///
/// Mirrors the Redis client: duplicate ids are rejected, fetches hide
/// messages for the visibility window, a zero window peeks.
#[derive(Default)]
pub struct FakeMessageClient {
    messages: Mutex<HashMap<String, StoredMessage>>,
    seq: AtomicU64,
    fail_fetches: AtomicBool,
}

impl FakeMessageClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent fetch fail with a transport error.
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Messages still stored, visible or not.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn visible_at(&self, id: &str) -> Option<i64> {
        self.messages.lock().get(id).map(|m| m.visible_at)
    }
}

#[async_trait]
impl MessageClient for FakeMessageClient {
    async fn put_message(&self, message: OutgoingMessage) -> QueueResult<()> {
        let mut messages = self.messages.lock();
        if messages.contains_key(&message.id) {
            return Err(QueueError::DuplicateJob(message.id));
        }
        messages.insert(
            message.id,
            StoredMessage {
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                content: message.content,
                metadata: message.metadata,
                visible_at: now_ms(),
                deliveries: 0,
            },
        );
        Ok(())
    }

    async fn get_messages(&self, limit: usize, visibility: Duration) -> QueueResult<Vec<ReceivedMessage>> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("service unavailable".to_string()));
        }

        let now = now_ms();
        let peek = visibility.is_zero();
        let hidden_until = now + i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX / 2);

        let mut messages = self.messages.lock();
        let mut ids: Vec<(u64, String)> = messages
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(id, m)| (m.seq, id.clone()))
            .collect();
        ids.sort();
        ids.truncate(limit);

        let mut out = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            let Some(message) = messages.get_mut(&id) else {
                continue;
            };
            if !peek {
                message.deliveries += 1;
                message.visible_at = hidden_until;
            }
            out.push(ReceivedMessage {
                receipt: make_receipt(&id, message.deliveries),
                id,
                content: message.content.clone(),
                metadata: message.metadata.clone(),
                delivery_count: message.deliveries,
            });
        }
        Ok(out)
    }

    async fn delete_message(&self, receipt: &str) -> QueueResult<()> {
        let id = receipt_message_id(receipt)?;
        self.messages.lock().remove(id);
        Ok(())
    }

    async fn change_visibility(&self, receipt: &str, visible_at: i64) -> QueueResult<()> {
        let id = receipt_message_id(receipt)?;
        if let Some(message) = self.messages.lock().get_mut(id) {
            message.visible_at = visible_at;
        }
        Ok(())
    }

    async fn stats(&self) -> QueueResult<MessageStats> {
        let now = now_ms();
        let messages = self.messages.lock();
        let visible = messages.values().filter(|m| m.visible_at <= now).count() as u64;
        Ok(MessageStats {
            visible,
            in_flight: messages.len() as u64 - visible,
        })
    }

    async fn purge(&self) -> QueueResult<()> {
        self.messages.lock().clear();
        Ok(())
    }
}

/// A queue over [`ManagedTransport`] backed by a fresh fake service.
pub fn managed_queue(name: &str) -> (Queue, Arc<FakeMessageClient>) {
    let client = FakeMessageClient::new();
    let transport = Arc::new(ManagedTransport::new(name, format!("q-{}", name), client.clone()));
    let queue = Queue::new(name, transport, JobOptions::new()).unwrap();
    (queue, client)
}

/// Worker options with a short polling interval.
pub fn fast_options(concurrency: usize) -> WorkerOptions {
    WorkerOptions {
        concurrency,
        polling_interval: Duration::from_millis(50),
        ..WorkerOptions::default()
    }
}

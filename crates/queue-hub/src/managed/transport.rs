//! Jobs stored as messages of a managed queue.
//!
//! The payload travels base64-encoded in the message body. Stored options
//! travel as JSON in the `_jobOpts` metadata entry, so the attempt counter
//! moves with the job rather than living in transport side-state.
//!
//! Finished jobs are deleted from the service immediately and their outcome
//! is kept in a local ledger. A retry deletes the message and enqueues a new
//! one under the same public id.
//!
//! Messages this transport fetched, deferred or re-enqueued may be hidden
//! from peeks for a while. Their last known record is tracked locally so
//! lookups keep seeing them until they are claimed, finished or deleted.

use super::client::{MessageClient, OutgoingMessage, ReceivedMessage};
use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, JobRecord, JobState, JobStatus};
use crate::ledger::OutcomeLedger;
use crate::options::StoredJobOptions;
use crate::registry::DriverKind;
use crate::scheduling::now_ms;
use crate::transport::{glob_match, JobCounts, NewJob, Transport};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Metadata key holding the channel id.
pub const METADATA_CHANNEL: &str = "channelId";
/// Metadata key holding the serialized stored options.
pub const METADATA_OPTIONS: &str = "_jobOpts";
/// Channel every message is published on.
pub const DEFAULT_CHANNEL: &str = "default";
/// Upper bound on messages inspected by lookups and listings.
pub const PEEK_LIMIT: usize = 1000;

/// Encodes a job as an outgoing message.
pub fn encode_message(id: &JobId, data: &Value, opts: &StoredJobOptions) -> QueueResult<OutgoingMessage> {
    let body = serde_json::to_vec(data)?;
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_CHANNEL.to_string(), DEFAULT_CHANNEL.to_string());
    metadata.insert(METADATA_OPTIONS.to_string(), serde_json::to_string(opts)?);

    Ok(OutgoingMessage {
        id: id.to_string(),
        content: STANDARD.encode(body),
        metadata,
    })
}

/// Decodes a delivered message. Unreadable parts degrade to defaults.
pub fn decode_message(message: ReceivedMessage, now_ms: i64) -> JobRecord {
    let opts = decode_options(&message);
    let data = decode_content(&message);
    let name = opts.job_name.clone().unwrap_or_default();

    let mut record = JobRecord::pending(JobId::from(message.id), name, data, opts);
    record.state = JobState::pending_for(&record.opts, now_ms);
    record.receipt = Some(message.receipt);
    record
}

fn decode_options(message: &ReceivedMessage) -> StoredJobOptions {
    let Some(raw) = message.metadata.get(METADATA_OPTIONS) else {
        warn!(message_id = %message.id, "Message has no job options metadata, using defaults");
        return StoredJobOptions::default();
    };

    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(message_id = %message.id, error = %e, "Malformed job options metadata, using defaults");
        StoredJobOptions::default()
    })
}

fn decode_content(message: &ReceivedMessage) -> Value {
    let parsed = STANDARD
        .decode(message.content.as_bytes())
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()));

    parsed.unwrap_or_else(|e| {
        warn!(message_id = %message.id, error = %e, "Malformed message content, using empty payload");
        Value::Object(Map::new())
    })
}

/// [`Transport`] over a [`MessageClient`].
pub struct ManagedTransport {
    queue_name: String,
    queue_id: String,
    client: Arc<dyn MessageClient>,
    in_flight: Mutex<HashMap<JobId, JobRecord>>,
    /// Pending jobs whose message may be hidden from peeks.
    hidden: Mutex<HashMap<JobId, JobRecord>>,
    /// Jobs deleted while their message was hidden and no receipt was known.
    dropped: Mutex<HashSet<JobId>>,
    ledger: OutcomeLedger,
}

impl ManagedTransport {
    pub fn new(queue_name: impl Into<String>, queue_id: impl Into<String>, client: Arc<dyn MessageClient>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue_id: queue_id.into(),
            client,
            in_flight: Mutex::new(HashMap::new()),
            hidden: Mutex::new(HashMap::new()),
            dropped: Mutex::new(HashSet::new()),
            ledger: OutcomeLedger::default(),
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Visible messages, decoded, without hiding them.
    async fn peek(&self) -> QueueResult<Vec<JobRecord>> {
        let messages = self.client.get_messages(PEEK_LIMIT, Duration::ZERO).await?;
        let now = now_ms();
        let dropped = self.dropped.lock().clone();
        Ok(messages
            .into_iter()
            .map(|m| decode_message(m, now))
            .filter(|r| self.ledger.get(&r.id).is_none() && !dropped.contains(&r.id))
            .collect())
    }

    async fn peek_one(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.peek().await?.into_iter().find(|r| &r.id == id))
    }

    /// Tracked pending record of `id`, with its state as of now.
    fn hidden_record(&self, id: &JobId) -> Option<JobRecord> {
        let mut record = self.hidden.lock().get(id).cloned()?;
        record.state = JobState::pending_for(&record.opts, now_ms());
        Some(record)
    }

    fn hidden_records(&self) -> Vec<JobRecord> {
        let now = now_ms();
        self.hidden
            .lock()
            .values()
            .cloned()
            .map(|mut record| {
                record.state = JobState::pending_for(&record.opts, now);
                record
            })
            .collect()
    }

    /// Last known record of an unfinished job, tracked or peeked.
    async fn pending_record(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let active = self.in_flight.lock().get(id).cloned();
        if let Some(record) = active.or_else(|| self.hidden_record(id)) {
            return Ok(Some(record));
        }
        self.peek_one(id).await
    }

    /// Deletes the message behind `record` and records how the job ended.
    async fn finish(
        &self,
        record: &JobRecord,
        state: JobState,
        result: Option<&Value>,
        reason: Option<&str>,
        remove: bool,
    ) -> QueueResult<()> {
        let tracked = self.in_flight.lock().remove(&record.id);
        let hidden = self.hidden.lock().remove(&record.id);
        let receipt = record
            .receipt
            .clone()
            .or_else(|| tracked.and_then(|r| r.receipt))
            .or_else(|| hidden.and_then(|r| r.receipt));

        match receipt {
            Some(receipt) => self.client.delete_message(&receipt).await?,
            None => debug!(queue = %self.queue_name, job_id = %record.id, "No receipt for finished job"),
        }

        let mut finished = record.clone();
        finished.state = state;
        finished.return_value = result.cloned();
        finished.failed_reason = reason.map(str::to_string);
        finished.finished_on = Some(now_ms());
        finished.receipt = None;
        self.ledger.record(finished, !remove);
        Ok(())
    }
}

#[async_trait]
impl Transport for ManagedTransport {
    fn driver(&self) -> DriverKind {
        DriverKind::ManagedQueue
    }

    async fn insert(&self, job: NewJob) -> QueueResult<JobRecord> {
        let id = job.id.unwrap_or_else(JobId::generate);
        let message = encode_message(&id, &job.data, &job.opts)?;
        self.client.put_message(message).await?;
        self.ledger.forget(&id);
        self.dropped.lock().remove(&id);

        debug!(queue = %self.queue_name, queue_id = %self.queue_id, job_id = %id, "Message enqueued");
        Ok(JobRecord::pending(id, job.name, job.data, job.opts))
    }

    async fn fetch_candidates(&self, limit: usize, visibility: Duration) -> QueueResult<Vec<JobRecord>> {
        let messages = self.client.get_messages(limit, visibility).await?;
        let now = now_ms();
        let mut records = Vec::with_capacity(messages.len());

        for message in messages {
            let id = JobId::from(message.id.as_str());
            let was_dropped = self.dropped.lock().remove(&id);
            if was_dropped || self.ledger.get(&id).is_some() {
                // Redelivery of a job that already finished or was removed here.
                debug!(queue = %self.queue_name, job_id = %id, "Dropping redelivered message");
                self.hidden.lock().remove(&id);
                if let Err(e) = self.client.delete_message(&message.receipt).await {
                    warn!(job_id = %id, error = %e, "Failed to delete redelivered message");
                }
                continue;
            }

            let record = decode_message(message, now);
            self.hidden.lock().insert(id, record.clone());
            records.push(record);
        }

        Ok(records)
    }

    async fn release(&self, record: &JobRecord, visible_at: i64) -> QueueResult<()> {
        if let Some(receipt) = &record.receipt {
            self.client.change_visibility(receipt, visible_at).await?;
        }
        self.hidden.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn claim(&self, record: &JobRecord) -> QueueResult<bool> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&record.id) {
            return Ok(false);
        }
        let mut active = record.clone();
        active.state = JobState::Active;
        active.processed_on = Some(now_ms());
        in_flight.insert(record.id.clone(), active);
        self.hidden.lock().remove(&record.id);
        Ok(true)
    }

    async fn find(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        if let Some(record) = self.ledger.get_listed(id) {
            return Ok(Some(record));
        }
        self.pending_record(id).await
    }

    async fn list(&self, states: &[JobState]) -> QueueResult<Vec<JobRecord>> {
        let wants = |state: JobState| states.is_empty() || states.contains(&state);
        let mut records = Vec::new();

        if wants(JobState::Waiting) || wants(JobState::Delayed) {
            let peeked = self.peek().await?;
            let tracked = self.hidden_records();
            let untracked: Vec<JobRecord> = {
                let active = self.in_flight.lock();
                let known: HashSet<&JobId> = tracked.iter().map(|r| &r.id).collect();
                peeked
                    .into_iter()
                    .filter(|r| !known.contains(&r.id) && !active.contains_key(&r.id))
                    .collect()
            };
            records.extend(tracked.into_iter().chain(untracked).filter(|r| wants(r.state)));
        }
        if wants(JobState::Active) {
            records.extend(self.in_flight.lock().values().cloned());
        }
        records.extend(self.ledger.listed(states));
        Ok(records)
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let stats = self.client.stats().await?;
        let delayed = self
            .hidden_records()
            .iter()
            .filter(|r| r.state == JobState::Delayed)
            .count() as u64;
        let mut counts = JobCounts {
            waiting: stats.visible,
            active: stats.in_flight.saturating_sub(delayed),
            delayed,
            ..JobCounts::default()
        };
        for record in self.ledger.listed(&[JobState::Completed, JobState::Failed]) {
            counts.bump(record.state);
        }
        Ok(counts)
    }

    async fn complete(&self, record: &JobRecord, result: &Value, remove: bool) -> QueueResult<()> {
        self.finish(record, JobState::Completed, Some(result), None, remove)
            .await
    }

    async fn fail(&self, record: &JobRecord, reason: &str, remove: bool) -> QueueResult<()> {
        self.finish(record, JobState::Failed, None, Some(reason), remove)
            .await
    }

    async fn reschedule(&self, record: &JobRecord, state: JobState) -> QueueResult<JobRecord> {
        let tracked = self.in_flight.lock().remove(&record.id);
        let hidden = self.hidden.lock().remove(&record.id);
        let receipt = record
            .receipt
            .clone()
            .or_else(|| tracked.and_then(|r| r.receipt))
            .or_else(|| hidden.and_then(|r| r.receipt));
        if let Some(receipt) = receipt {
            self.client.delete_message(&receipt).await?;
        }

        let message = encode_message(&record.id, &record.data, &record.opts)?;
        self.client.put_message(message).await?;
        // A retried job is live again; its old outcome must not drop the new message.
        self.ledger.forget(&record.id);
        self.dropped.lock().remove(&record.id);

        debug!(
            queue = %self.queue_name,
            job_id = %record.id,
            attempt = record.opts.current_attempt(),
            process_after = ?record.opts.process_after,
            "Message re-enqueued"
        );

        let mut requeued = record.clone();
        requeued.state = state;
        requeued.receipt = None;
        requeued.processed_on = None;
        requeued.finished_on = None;
        requeued.return_value = None;
        requeued.failed_reason = None;
        self.hidden.lock().insert(record.id.clone(), requeued.clone());
        Ok(requeued)
    }

    async fn delete(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let tracked = self.in_flight.lock().remove(id);
        let hidden = self.hidden.lock().remove(id);
        let known = tracked.or(hidden);

        let receipt = match known.as_ref().and_then(|r| r.receipt.clone()) {
            Some(receipt) => Some(receipt),
            None => self.peek_one(id).await?.and_then(|r| r.receipt),
        };
        match receipt {
            Some(receipt) => self.client.delete_message(&receipt).await?,
            None if known.is_some() => {
                // Message is hidden; drop it when it is next delivered.
                self.dropped.lock().insert(id.clone());
            }
            None => {}
        }

        let ledgered = self.ledger.forget(id);
        Ok(known.or(ledgered))
    }

    async fn status(&self, id: &JobId) -> QueueResult<Option<JobStatus>> {
        if let Some(record) = self.ledger.get(id) {
            return Ok(Some(JobStatus::from(&record)));
        }
        Ok(self.pending_record(id).await?.as_ref().map(JobStatus::from))
    }

    async fn update_data(&self, id: &JobId, _data: &Value) -> QueueResult<()> {
        Err(QueueError::Transport(format!(
            "job {id} cannot be updated: managed queue messages are immutable"
        )))
    }

    async fn clean(
        &self,
        grace: Duration,
        limit: usize,
        state: Option<JobState>,
    ) -> QueueResult<Vec<JobRecord>> {
        if state.is_some_and(|s| !s.is_terminal()) {
            debug!(queue = %self.queue_name, "Clean of unfinished jobs is not supported by managed queues");
            return Ok(Vec::new());
        }

        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let now = now_ms();
        Ok(self.ledger.drain_where(limit, |record| {
            let age = now.saturating_sub(record.finished_on.unwrap_or(0));
            state.map_or(true, |s| record.state == s) && age > grace_ms
        }))
    }

    async fn empty(&self) -> QueueResult<()> {
        self.client.purge().await?;
        self.in_flight.lock().clear();
        self.hidden.lock().clear();
        self.dropped.lock().clear();
        self.ledger.clear();
        Ok(())
    }

    async fn remove_matching(&self, pattern: &str) -> QueueResult<u64> {
        let matches = |id: &JobId| glob_match(pattern, id.as_str());
        let mut receipts: HashMap<JobId, Option<String>> = HashMap::new();

        for record in self.peek().await? {
            if matches(&record.id) {
                receipts.insert(record.id, record.receipt);
            }
        }
        for tracked in [&self.hidden, &self.in_flight] {
            let mut tracked = tracked.lock();
            tracked.retain(|id, record| {
                if !matches(id) {
                    return true;
                }
                let slot = receipts.entry(id.clone()).or_insert(None);
                if slot.is_none() {
                    *slot = record.receipt.clone();
                }
                false
            });
        }

        let mut removed = receipts.len() as u64;
        for (id, receipt) in receipts {
            match receipt {
                Some(receipt) => self.client.delete_message(&receipt).await?,
                None => {
                    self.dropped.lock().insert(id);
                }
            }
        }

        let finished = self
            .ledger
            .drain_where(0, |record| glob_match(pattern, record.id.as_str()));
        removed += finished.len() as u64;
        Ok(removed)
    }

    async fn close(&self) -> QueueResult<()> {
        self.client.close().await
    }
}

//! In-process memory transport.
//!
//! Jobs live in a table owned by the transport. Every transition takes the
//! table's write lock, so single-job mutations are atomic. Nothing survives
//! a process restart.

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, JobRecord, JobState, JobStatus};
use crate::ledger::OutcomeLedger;
use crate::queue::Queue;
use crate::registry::{DriverKind, QueueFactory};
use crate::scheduling::now_ms;
use crate::transport::{glob_match, JobCounts, NewJob, Transport};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    record: JobRecord,
}

/// Memory-backed [`Transport`].
pub struct MemoryTransport {
    queue_name: String,
    jobs: RwLock<HashMap<JobId, Entry>>,
    ledger: OutcomeLedger,
    id_counter: AtomicU64,
    seq: AtomicU64,
}

impl MemoryTransport {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            jobs: RwLock::new(HashMap::new()),
            ledger: OutcomeLedger::default(),
            id_counter: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> JobId {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        JobId::from(format!("local-{}-{}", n, now_ms()))
    }

    /// Snapshot of entries matching `filter`, in insertion order.
    fn collect<F>(&self, filter: F) -> Vec<JobRecord>
    where
        F: Fn(&JobRecord) -> bool,
    {
        let jobs = self.jobs.read();
        let mut entries: Vec<&Entry> = jobs.values().filter(|e| filter(&e.record)).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Moves a job to a terminal state, dropping it from the table if `remove`.
    fn finish(&self, id: &JobId, state: JobState, result: Option<&Value>, reason: Option<&str>, remove: bool) {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(id) else {
            debug!(queue = %self.queue_name, job_id = %id, "Finish on missing job ignored");
            return;
        };

        entry.record.state = state;
        entry.record.return_value = result.cloned();
        entry.record.failed_reason = reason.map(str::to_string);
        entry.record.finished_on = Some(now_ms());

        if remove {
            if let Some(entry) = jobs.remove(id) {
                self.ledger.record(entry.record, false);
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn driver(&self) -> DriverKind {
        DriverKind::Local
    }

    async fn insert(&self, job: NewJob) -> QueueResult<JobRecord> {
        let id = job.id.unwrap_or_else(|| self.next_id());
        let record = JobRecord::pending(id.clone(), job.name, job.data, job.opts);

        let mut jobs = self.jobs.write();
        if jobs.contains_key(&id) {
            return Err(QueueError::DuplicateJob(id.to_string()));
        }
        self.ledger.forget(&id);
        jobs.insert(
            id,
            Entry {
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn fetch_candidates(&self, _limit: usize, _visibility: Duration) -> QueueResult<Vec<JobRecord>> {
        Ok(self.collect(|r| matches!(r.state, JobState::Waiting | JobState::Delayed)))
    }

    async fn claim(&self, record: &JobRecord) -> QueueResult<bool> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&record.id) {
            Some(entry) if matches!(entry.record.state, JobState::Waiting | JobState::Delayed) => {
                entry.record.state = JobState::Active;
                entry.record.processed_on = Some(now_ms());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.jobs.read().get(id).map(|e| e.record.clone()))
    }

    async fn list(&self, states: &[JobState]) -> QueueResult<Vec<JobRecord>> {
        Ok(self.collect(|r| states.is_empty() || states.contains(&r.state)))
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let mut counts = JobCounts::default();
        for entry in self.jobs.read().values() {
            counts.bump(entry.record.state);
        }
        Ok(counts)
    }

    async fn complete(&self, record: &JobRecord, result: &Value, remove: bool) -> QueueResult<()> {
        self.finish(&record.id, JobState::Completed, Some(result), None, remove);
        Ok(())
    }

    async fn fail(&self, record: &JobRecord, reason: &str, remove: bool) -> QueueResult<()> {
        self.finish(&record.id, JobState::Failed, None, Some(reason), remove);
        Ok(())
    }

    async fn reschedule(&self, record: &JobRecord, state: JobState) -> QueueResult<JobRecord> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(&record.id)
            .ok_or_else(|| QueueError::NotFound(record.id.to_string()))?;

        entry.record.opts = record.opts.clone();
        entry.record.state = state;
        entry.record.processed_on = None;
        entry.record.finished_on = None;
        entry.record.return_value = None;
        entry.record.failed_reason = None;
        Ok(entry.record.clone())
    }

    async fn delete(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let removed = self.jobs.write().remove(id).map(|e| e.record);
        self.ledger.forget(id);
        Ok(removed)
    }

    async fn status(&self, id: &JobId) -> QueueResult<Option<JobStatus>> {
        if let Some(entry) = self.jobs.read().get(id) {
            return Ok(Some(JobStatus::from(&entry.record)));
        }
        Ok(self.ledger.get(id).as_ref().map(JobStatus::from))
    }

    async fn update_data(&self, id: &JobId, data: &Value) -> QueueResult<()> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        entry.record.data = data.clone();
        Ok(())
    }

    async fn update_progress(&self, id: &JobId, progress: &Value) -> QueueResult<()> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        entry.record.progress = Some(progress.clone());
        Ok(())
    }

    async fn clean(
        &self,
        grace: Duration,
        limit: usize,
        state: Option<JobState>,
    ) -> QueueResult<Vec<JobRecord>> {
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let now = now_ms();

        let mut jobs = self.jobs.write();
        let mut expired: Vec<(u64, JobId)> = jobs
            .iter()
            .filter(|(_, e)| match state {
                Some(wanted) => e.record.state == wanted,
                None => e.record.state.is_terminal(),
            })
            .filter(|(_, e)| {
                let since = e.record.finished_on.unwrap_or_else(|| e.record.opts.created_at());
                now.saturating_sub(since) > grace_ms
            })
            .map(|(id, e)| (e.seq, id.clone()))
            .collect();
        expired.sort_by_key(|(seq, _)| *seq);
        if limit > 0 {
            expired.truncate(limit);
        }

        let cleaned: Vec<JobRecord> = expired
            .into_iter()
            .filter_map(|(_, id)| jobs.remove(&id).map(|e| e.record))
            .collect();
        drop(jobs);

        for record in &cleaned {
            self.ledger.forget(&record.id);
        }
        Ok(cleaned)
    }

    async fn empty(&self) -> QueueResult<()> {
        self.jobs.write().clear();
        self.ledger.clear();
        Ok(())
    }

    async fn remove_matching(&self, pattern: &str) -> QueueResult<u64> {
        let mut jobs = self.jobs.write();
        let matching: Vec<JobId> = jobs
            .keys()
            .filter(|id| glob_match(pattern, id.as_str()))
            .cloned()
            .collect();
        for id in &matching {
            jobs.remove(id);
            self.ledger.forget(id);
        }
        Ok(matching.len() as u64)
    }

    async fn close(&self) -> QueueResult<()> {
        debug!(queue = %self.queue_name, "Memory transport closed");
        Ok(())
    }
}

/// Factory for in-memory queues.
///
/// Queues are cached by name so producers and workers created separately
/// share one job table.
#[derive(Default)]
pub struct LocalQueueFactory {
    queues: Mutex<HashMap<String, Queue>>,
}

impl LocalQueueFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueFactory for LocalQueueFactory {
    fn driver(&self) -> DriverKind {
        DriverKind::Local
    }

    async fn create_queue(&self, name: &str, config: &QueueConfig) -> QueueResult<Queue> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let transport = Arc::new(MemoryTransport::new(name));
        let queue = Queue::new(name, transport, config.default_job_options.clone())?;
        queues.insert(name.to_string(), queue.clone());
        info!(queue = %name, driver = %DriverKind::Local, "Created queue");
        Ok(queue)
    }
}

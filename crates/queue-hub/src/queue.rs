//! Producer-facing queue.

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobRecord, JobState};
use crate::metrics::JobMetrics;
use crate::options::{JobOptions, StoredJobOptions};
use crate::registry::DriverKind;
use crate::scheduling::now_ms;
use crate::transport::{JobCounts, NewJob, Transport};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

/// Events published by a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Waiting { job_id: JobId },
    Delayed { job_id: JobId, process_after: i64 },
    Active { job_id: JobId },
    Completed { job_id: JobId, result: Value },
    Failed { job_id: JobId, reason: String },
    Progress { job_id: JobId, progress: Value },
    Removed { job_id: JobId },
    Cleaned { job_ids: Vec<JobId> },
    Drained,
    Paused,
    Resumed,
    Error { message: String },
    Closed,
}

struct QueueInner {
    name: String,
    default_options: JobOptions,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<QueueEvent>,
    paused: AtomicBool,
}

/// Named collection of jobs on one transport.
///
/// Cloning is cheap; clones share storage, events and pause state.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("driver", &self.inner.transport.driver())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Creates a queue over `transport`.
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        default_options: JobOptions,
    ) -> QueueResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::Configuration("queue name is required".to_string()));
        }
        default_options.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(QueueInner {
                name,
                default_options,
                transport,
                events,
                paused: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn driver(&self) -> DriverKind {
        self.inner.transport.driver()
    }

    pub fn default_options(&self) -> &JobOptions {
        &self.inner.default_options
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    fn wrap(&self, record: JobRecord) -> Job {
        Job::new(record, self.inner.transport.clone())
    }

    /// Enqueues a job.
    ///
    /// Per-call options are merged over the queue defaults. Fails with
    /// `DuplicateJob` if a live job already uses the requested `jobId`.
    pub async fn add<T: Serialize>(
        &self,
        name: &str,
        data: T,
        opts: Option<JobOptions>,
    ) -> QueueResult<Job> {
        let data = serde_json::to_value(data)?;
        let merged = opts
            .unwrap_or_default()
            .merged_over(&self.inner.default_options);
        merged.validate()?;

        let stored = StoredJobOptions::new(name, &merged, now_ms(), None);
        let record = self
            .inner
            .transport
            .insert(NewJob {
                id: merged.job_id.clone(),
                name: name.to_string(),
                data,
                opts: stored,
            })
            .await?;

        JobMetrics::job_enqueued(&self.inner.name, name);
        debug!(
            queue = %self.inner.name,
            job_id = %record.id,
            job_name = %name,
            state = %record.state,
            "Job added"
        );

        match (record.state, record.opts.process_after) {
            (JobState::Delayed, Some(process_after)) => self.emit(QueueEvent::Delayed {
                job_id: record.id.clone(),
                process_after,
            }),
            _ => self.emit(QueueEvent::Waiting {
                job_id: record.id.clone(),
            }),
        }

        Ok(self.wrap(record))
    }

    /// Looks up a job. Unknown ids yield `None`.
    pub async fn get_job(&self, id: impl Into<JobId>) -> QueueResult<Option<Job>> {
        let id = id.into();
        Ok(self
            .inner
            .transport
            .find(&id)
            .await?
            .map(|record| self.wrap(record)))
    }

    /// Jobs in any of `states`; every job when `states` is empty.
    pub async fn get_jobs(&self, states: &[JobState]) -> QueueResult<Vec<Job>> {
        let records = self.inner.transport.list(states).await?;
        Ok(records.into_iter().map(|r| self.wrap(r)).collect())
    }

    pub async fn get_waiting(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(&[JobState::Waiting]).await
    }

    pub async fn get_active(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(&[JobState::Active]).await
    }

    pub async fn get_completed(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(&[JobState::Completed]).await
    }

    pub async fn get_failed(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(&[JobState::Failed]).await
    }

    pub async fn get_delayed(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(&[JobState::Delayed]).await
    }

    /// Counts per state. Also refreshes the queue depth gauges.
    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        let counts = self.inner.transport.counts().await?;
        JobMetrics::update_queue_depth(&self.inner.name, &counts);
        Ok(counts)
    }

    pub async fn get_waiting_count(&self) -> QueueResult<u64> {
        Ok(self.get_job_counts().await?.waiting)
    }

    pub async fn get_active_count(&self) -> QueueResult<u64> {
        Ok(self.get_job_counts().await?.active)
    }

    pub async fn get_completed_count(&self) -> QueueResult<u64> {
        Ok(self.get_job_counts().await?.completed)
    }

    pub async fn get_failed_count(&self) -> QueueResult<u64> {
        Ok(self.get_job_counts().await?.failed)
    }

    pub async fn get_delayed_count(&self) -> QueueResult<u64> {
        Ok(self.get_job_counts().await?.delayed)
    }

    /// Stops workers on this queue from starting new jobs.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(queue = %self.inner.name, "Queue paused");
            self.emit(QueueEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!(queue = %self.inner.name, "Queue resumed");
            self.emit(QueueEvent::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Deletes finished jobs older than `grace`, at most `limit` (0 = all).
    pub async fn clean(
        &self,
        grace: Duration,
        limit: usize,
        state: Option<JobState>,
    ) -> QueueResult<Vec<Job>> {
        let cleaned = self.inner.transport.clean(grace, limit, state).await?;
        if !cleaned.is_empty() {
            info!(queue = %self.inner.name, count = cleaned.len(), "Cleaned jobs");
            self.emit(QueueEvent::Cleaned {
                job_ids: cleaned.iter().map(|r| r.id.clone()).collect(),
            });
        }
        Ok(cleaned.into_iter().map(|r| self.wrap(r)).collect())
    }

    /// Deletes every job.
    pub async fn empty(&self) -> QueueResult<()> {
        self.inner.transport.empty().await?;
        info!(queue = %self.inner.name, "Queue emptied");
        Ok(())
    }

    /// Removes one job, returning it if it existed.
    pub async fn remove(&self, id: impl Into<JobId>) -> QueueResult<Option<Job>> {
        let id = id.into();
        let removed = self.inner.transport.delete(&id).await?;
        if removed.is_some() {
            self.emit(QueueEvent::Removed { job_id: id });
        }
        Ok(removed.map(|r| self.wrap(r)))
    }

    /// Removes jobs whose id matches a `*` glob.
    pub async fn remove_jobs(&self, pattern: &str) -> QueueResult<u64> {
        let removed = self.inner.transport.remove_matching(pattern).await?;
        debug!(queue = %self.inner.name, pattern = %pattern, removed, "Removed jobs by pattern");
        Ok(removed)
    }

    /// Full reset; same as [`empty`](Self::empty) for the bundled drivers.
    pub async fn obliterate(&self, force: bool) -> QueueResult<()> {
        info!(queue = %self.inner.name, force, "Obliterating queue");
        self.empty().await
    }

    /// Releases transport resources.
    pub async fn close(&self) -> QueueResult<()> {
        self.inner.transport.close().await?;
        info!(queue = %self.inner.name, "Queue closed");
        self.emit(QueueEvent::Closed);
        Ok(())
    }
}

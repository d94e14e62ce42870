//! Job handle and persisted job record.

use crate::error::{QueueError, QueueResult};
use crate::options::{JobOptions, StoredJobOptions};
use crate::scheduling::now_ms;
use crate::transport::Transport;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Interval between status checks in [`Job::wait_until_finished`].
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Unique job identifier.
///
/// Producers may supply a string or an integer; it is always held as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => Self(s),
            RawId::Unsigned(n) => Self(n.to_string()),
            RawId::Signed(n) => Self(n.to_string()),
        })
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&JobId> for JobId {
    fn from(id: &JobId) -> Self {
        id.clone()
    }
}

impl From<u64> for JobId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<i64> for JobId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    /// Every state, in listing order.
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
    ];

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// State of a job that has not run yet, given its schedule.
    pub fn pending_for(opts: &StoredJobOptions, now_ms: i64) -> Self {
        if opts.is_ready_at(now_ms) {
            JobState::Waiting
        } else {
            JobState::Delayed
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        };
        f.write_str(s)
    }
}

/// Transport-neutral persisted form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub opts: StoredJobOptions,

    /// State as of the moment the record was read.
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<i64>,

    /// Delivery receipt for message-based transports.
    #[serde(skip)]
    pub receipt: Option<String>,
}

impl JobRecord {
    /// Builds a fresh record for a job that has not run yet.
    pub fn pending(id: JobId, name: String, data: Value, opts: StoredJobOptions) -> Self {
        let state = JobState::pending_for(&opts, opts.created_at());
        Self {
            id,
            name,
            data,
            opts,
            state,
            return_value: None,
            failed_reason: None,
            progress: None,
            processed_on: None,
            finished_on: None,
            receipt: None,
        }
    }
}

/// Serializable view of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub timestamp: i64,
    pub process_after: Option<i64>,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub progress: Option<Value>,
}

/// Status of a job as reported by its transport.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
}

impl From<&JobRecord> for JobStatus {
    fn from(record: &JobRecord) -> Self {
        Self {
            state: record.state,
            return_value: record.return_value.clone(),
            failed_reason: record.failed_reason.clone(),
        }
    }
}

/// Handle to one job, bound to the transport that stores it.
#[derive(Clone)]
pub struct Job {
    record: JobRecord,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.record.id)
            .field("name", &self.record.name)
            .field("state", &self.record.state)
            .field("attempt", &self.current_attempt())
            .finish_non_exhaustive()
    }
}

impl Job {
    pub(crate) fn new(record: JobRecord, transport: Arc<dyn Transport>) -> Self {
        Self { record, transport }
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn data(&self) -> &Value {
        &self.record.data
    }

    /// Deserializes the payload into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_value(self.record.data.clone())?)
    }

    /// Options in producer shape.
    pub fn opts(&self) -> JobOptions {
        self.record.opts.to_job_options()
    }

    pub fn stored_options(&self) -> &StoredJobOptions {
        &self.record.opts
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// State when this handle was last refreshed.
    pub fn state(&self) -> JobState {
        self.record.state
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.record.return_value.as_ref()
    }

    pub fn failed_reason(&self) -> Option<&str> {
        self.record.failed_reason.as_deref()
    }

    pub fn current_attempt(&self) -> u32 {
        self.record.opts.current_attempt()
    }

    /// Bumps the attempt counter on this handle only.
    pub fn increment_attempt(&mut self) {
        self.record.opts.increment_attempt();
    }

    pub fn should_process_now(&self) -> bool {
        self.should_process_at(now_ms())
    }

    pub fn should_process_at(&self, now_ms: i64) -> bool {
        self.record.opts.is_ready_at(now_ms)
    }

    pub fn has_exceeded_max_attempts(&self) -> bool {
        self.record.opts.has_exceeded_max_attempts()
    }

    /// Backoff in milliseconds before the retry that follows `attempt`.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        self.record.opts.backoff_delay(attempt)
    }

    pub fn should_remove_on_complete(&self) -> bool {
        self.record.opts.should_remove_on_complete()
    }

    pub fn should_remove_on_fail(&self) -> bool {
        self.record.opts.should_remove_on_fail()
    }

    pub(crate) fn mark_active(&mut self, now_ms: i64) {
        self.record.state = JobState::Active;
        self.record.processed_on = Some(now_ms);
    }

    /// Marks the job completed and applies the remove-on-complete policy.
    ///
    /// A no-op if the job is already gone.
    pub async fn move_to_completed(&mut self, result: Value) -> QueueResult<()> {
        let remove = self.should_remove_on_complete();
        self.transport.complete(&self.record, &result, remove).await?;
        self.record.state = JobState::Completed;
        self.record.return_value = Some(result);
        self.record.finished_on = Some(now_ms());
        debug!(job_id = %self.record.id, removed = remove, "Job completed");
        Ok(())
    }

    /// Marks the job failed and applies the remove-on-fail policy.
    ///
    /// A no-op if the job is already gone.
    pub async fn move_to_failed(&mut self, reason: &str) -> QueueResult<()> {
        let remove = self.should_remove_on_fail();
        self.transport.fail(&self.record, reason, remove).await?;
        self.record.state = JobState::Failed;
        self.record.failed_reason = Some(reason.to_string());
        self.record.finished_on = Some(now_ms());
        debug!(job_id = %self.record.id, removed = remove, "Job failed");
        Ok(())
    }

    /// Deletes the job. Missing jobs are not an error.
    pub async fn remove(&self) -> QueueResult<()> {
        self.transport.delete(&self.record.id).await.map(|_| ())
    }

    /// Same as [`remove`](Self::remove).
    pub async fn discard(&self) -> QueueResult<()> {
        self.remove().await
    }

    /// Re-queues the job for immediate processing with the next attempt number.
    pub async fn retry(&mut self) -> QueueResult<()> {
        self.increment_attempt();
        self.reschedule_at(now_ms()).await
    }

    /// Persists the current attempt counter with a new `process_after`.
    pub(crate) async fn reschedule_at(&mut self, process_after: i64) -> QueueResult<()> {
        self.record.opts.process_after = Some(process_after);
        let state = JobState::pending_for(&self.record.opts, now_ms());
        self.record = self.transport.reschedule(&self.record, state).await?;
        Ok(())
    }

    /// Current state as seen by the transport, or `None` if the job is unknown.
    pub async fn get_state(&self) -> QueueResult<Option<JobState>> {
        Ok(self
            .transport
            .status(&self.record.id)
            .await?
            .map(|status| status.state))
    }

    /// Replaces the job payload.
    pub async fn update(&mut self, data: Value) -> QueueResult<()> {
        self.transport.update_data(&self.record.id, &data).await?;
        self.record.data = data;
        Ok(())
    }

    /// Stores a progress value. Transports may ignore it.
    pub async fn update_progress(&mut self, progress: Value) -> QueueResult<()> {
        self.transport
            .update_progress(&self.record.id, &progress)
            .await?;
        self.record.progress = Some(progress);
        Ok(())
    }

    /// Polls until the job reaches a terminal state.
    ///
    /// Returns the stored result on completion and re-raises the stored
    /// reason as [`QueueError::JobFailed`] on failure.
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> QueueResult<Value> {
        let started = Instant::now();
        loop {
            match self.transport.status(&self.record.id).await? {
                Some(status) if status.state == JobState::Completed => {
                    return Ok(status.return_value.unwrap_or(Value::Null));
                }
                Some(status) if status.state == JobState::Failed => {
                    return Err(QueueError::JobFailed {
                        job_id: self.record.id.to_string(),
                        reason: status.failed_reason.unwrap_or_default(),
                    });
                }
                Some(_) => {}
                None => return Err(QueueError::NotFound(self.record.id.to_string())),
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(QueueError::WaitTimeout {
                        job_id: self.record.id.to_string(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.record.id.clone(),
            name: self.record.name.clone(),
            data: self.record.data.clone(),
            opts: self.opts(),
            state: self.record.state,
            attempts_made: self.current_attempt().saturating_sub(1),
            timestamp: self.record.opts.created_at(),
            process_after: self.record.opts.process_after,
            return_value: self.record.return_value.clone(),
            failed_reason: self.record.failed_reason.clone(),
            progress: self.record.progress.clone(),
        }
    }
}

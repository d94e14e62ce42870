//! Storage contract shared by every queue driver.

use crate::error::QueueResult;
use crate::job::{JobId, JobRecord, JobState, JobStatus};
use crate::options::StoredJobOptions;
use crate::registry::DriverKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// A job about to be persisted.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-supplied id; the transport generates one when absent.
    pub id: Option<JobId>,
    pub name: String,
    pub data: Value,
    pub opts: StoredJobOptions,
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Delayed => self.delayed,
        }
    }

    pub(crate) fn bump(&mut self, state: JobState) {
        let slot = match state {
            JobState::Waiting => &mut self.waiting,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Delayed => &mut self.delayed,
        };
        *slot += 1;
    }
}

/// Persistence operations a queue driver provides.
///
/// Single-job transitions must be atomic with respect to the transport
/// itself. Operations on unknown jobs are no-ops unless stated otherwise.
#[async_trait]
pub trait Transport: Send + Sync {
    fn driver(&self) -> DriverKind;

    /// Persists a new job. Fails with `DuplicateJob` if a live job already
    /// uses the requested id.
    async fn insert(&self, job: NewJob) -> QueueResult<JobRecord>;

    /// Jobs that are not running and not finished, in storage order.
    ///
    /// `limit` and `visibility` apply to message-based transports, which hide
    /// fetched jobs from other consumers for `visibility`.
    async fn fetch_candidates(&self, limit: usize, visibility: Duration) -> QueueResult<Vec<JobRecord>>;

    /// Returns a fetched but unclaimed job, visible again at `visible_at`.
    async fn release(&self, _record: &JobRecord, _visible_at: i64) -> QueueResult<()> {
        Ok(())
    }

    /// Marks a fetched job active. Returns false if another consumer got it.
    async fn claim(&self, record: &JobRecord) -> QueueResult<bool>;

    async fn find(&self, id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Jobs in any of `states`; all visible jobs when `states` is empty.
    async fn list(&self, states: &[JobState]) -> QueueResult<Vec<JobRecord>>;

    async fn counts(&self) -> QueueResult<JobCounts>;

    async fn complete(&self, record: &JobRecord, result: &Value, remove: bool) -> QueueResult<()>;

    async fn fail(&self, record: &JobRecord, reason: &str, remove: bool) -> QueueResult<()>;

    /// Stores `record.opts` and moves the job back to `state`.
    async fn reschedule(&self, record: &JobRecord, state: JobState) -> QueueResult<JobRecord>;

    /// Deletes a job, returning it if it existed.
    async fn delete(&self, id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Current status, including finished jobs that have since been removed.
    async fn status(&self, id: &JobId) -> QueueResult<Option<JobStatus>>;

    async fn update_data(&self, id: &JobId, data: &Value) -> QueueResult<()>;

    async fn update_progress(&self, _id: &JobId, _progress: &Value) -> QueueResult<()> {
        Ok(())
    }

    /// Deletes jobs finished more than `grace` ago, at most `limit` (0 = all).
    ///
    /// Without a state filter only completed and failed jobs are considered.
    async fn clean(
        &self,
        grace: Duration,
        limit: usize,
        state: Option<JobState>,
    ) -> QueueResult<Vec<JobRecord>>;

    async fn empty(&self) -> QueueResult<()>;

    /// Deletes jobs whose id matches a `*` glob. Returns how many were removed.
    async fn remove_matching(&self, pattern: &str) -> QueueResult<u64>;

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

/// Matches `text` against a pattern where `*` stands for any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("job-1", "job-1"));
        assert!(!glob_match("job-1", "job-12"));
    }

    #[test]
    fn test_glob_wildcards() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("email-*", "email-42"));
        assert!(glob_match("*-42", "email-42"));
        assert!(glob_match("e*l-*2", "email-42"));
        assert!(!glob_match("sms-*", "email-42"));
        assert!(glob_match("a**b", "ab"));
    }

    #[test]
    fn test_counts_by_state() {
        let mut counts = JobCounts::default();
        counts.bump(JobState::Failed);
        counts.bump(JobState::Failed);
        assert_eq!(counts.get(JobState::Failed), 2);
        assert_eq!(counts.get(JobState::Waiting), 0);
    }
}

//! Job options and their stored form.
//!
//! [`JobOptions`] is what producers pass to [`Queue::add`](crate::Queue::add).
//! [`StoredJobOptions`] is what travels with a job through a transport: the
//! producer options plus the scheduling state computed at enqueue time.

use crate::error::{QueueError, QueueResult};
use crate::job::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry spacing policy.
///
/// Accepts either a bare number of milliseconds or `{ "type": ..., "delay": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Backoff {
    /// Constant delay regardless of attempt.
    Delay(u64),
    /// Typed policy.
    Policy {
        #[serde(rename = "type")]
        kind: BackoffKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
    },
}

/// Backoff policy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    /// Unrecognised type; falls back to the configured delay.
    #[serde(other)]
    Other,
}

impl Backoff {
    /// Fixed backoff of `delay_ms`.
    pub fn fixed(delay_ms: u64) -> Self {
        Backoff::Policy {
            kind: BackoffKind::Fixed,
            delay: Some(delay_ms),
        }
    }

    /// Exponential backoff starting at `delay_ms`.
    pub fn exponential(delay_ms: u64) -> Self {
        Backoff::Policy {
            kind: BackoffKind::Exponential,
            delay: Some(delay_ms),
        }
    }

    /// Delay in milliseconds before the retry that follows `attempt`.
    ///
    /// Exponential: `delay * 2^(attempt - 1)`, saturating at `u64::MAX`.
    /// Attempt 0 is treated as attempt 1.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        match self {
            Backoff::Delay(ms) => *ms,
            Backoff::Policy {
                kind: BackoffKind::Exponential,
                delay,
            } => {
                let base = delay.unwrap_or(0);
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor)
            }
            Backoff::Policy { delay, .. } => delay.unwrap_or(0),
        }
    }
}

/// Removal policy after a terminal state: `true` or a positive count removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemovalPolicy {
    Flag(bool),
    Keep(i64),
}

impl RemovalPolicy {
    /// Returns true if the job should be deleted once it reaches the state.
    pub fn should_remove(&self) -> bool {
        match self {
            RemovalPolicy::Flag(flag) => *flag,
            RemovalPolicy::Keep(count) => *count > 0,
        }
    }
}

impl From<bool> for RemovalPolicy {
    fn from(flag: bool) -> Self {
        RemovalPolicy::Flag(flag)
    }
}

/// Pass-through fields the queue stores but never interprets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "stack_trace_limit")]
    pub stack_trace_limit: Option<u32>,

    /// Any other keys supplied by the producer.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl JobExtensions {
    fn merged_over(&self, defaults: &JobExtensions) -> JobExtensions {
        let mut extra = defaults.extra.clone();
        extra.extend(self.extra.clone());
        JobExtensions {
            repeat: self.repeat.clone().or_else(|| defaults.repeat.clone()),
            stack_trace_limit: self.stack_trace_limit.or(defaults.stack_trace_limit),
            extra,
        }
    }
}

/// Per-job scheduling options. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Lower runs first; unset sorts last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Milliseconds to wait before the job becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,

    /// Maximum total tries; unset means a failure is final.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    /// Reverses the tie-break among jobs of equal priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifo: Option<bool>,

    /// Per-attempt execution deadline in milliseconds; 0 disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Caller-supplied identity.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "job_id")]
    pub job_id: Option<JobId>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "remove_on_complete")]
    pub remove_on_complete: Option<RemovalPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "remove_on_fail")]
    pub remove_on_fail: Option<RemovalPolicy>,

    #[serde(flatten)]
    pub extensions: JobExtensions,
}

impl JobOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the delay in milliseconds.
    pub fn delay(mut self, delay_ms: i64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Set the maximum number of attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the backoff policy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Mark the job LIFO.
    pub fn lifo(mut self, lifo: bool) -> Self {
        self.lifo = Some(lifo);
        self
    }

    /// Set the per-attempt timeout in milliseconds.
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Use a caller-supplied job id.
    pub fn job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set the remove-on-complete policy.
    pub fn remove_on_complete(mut self, policy: impl Into<RemovalPolicy>) -> Self {
        self.remove_on_complete = Some(policy.into());
        self
    }

    /// Set the remove-on-fail policy.
    pub fn remove_on_fail(mut self, policy: impl Into<RemovalPolicy>) -> Self {
        self.remove_on_fail = Some(policy.into());
        self
    }

    /// Merge these options over `defaults`; fields set here win.
    pub fn merged_over(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            priority: self.priority.or(defaults.priority),
            delay: self.delay.or(defaults.delay),
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.clone().or_else(|| defaults.backoff.clone()),
            lifo: self.lifo.or(defaults.lifo),
            timeout: self.timeout.or(defaults.timeout),
            job_id: self.job_id.clone().or_else(|| defaults.job_id.clone()),
            remove_on_complete: self.remove_on_complete.or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.or(defaults.remove_on_fail),
            extensions: self.extensions.merged_over(&defaults.extensions),
        }
    }

    /// Reject options that can never schedule a job.
    pub fn validate(&self) -> QueueResult<()> {
        if self.attempts == Some(0) {
            return Err(QueueError::Validation(
                "attempts must be at least 1".to_string(),
            ));
        }
        if let Some(id) = &self.job_id {
            if id.as_str().trim().is_empty() {
                return Err(QueueError::Validation("jobId must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Options as persisted with a job.
///
/// `Default` is the degraded form used when stored metadata cannot be read:
/// no schedule, attempt 1, no limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredJobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Earliest eligible time, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_after: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    /// 1-based attempt counter; unset reads as 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_attempt: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(flatten)]
    pub options: JobOptions,
}

impl StoredJobOptions {
    /// Builds the stored form at enqueue time.
    ///
    /// `preserved_attempt` carries an attempt count forward when a job is
    /// re-inserted by a retry.
    pub fn new(name: &str, opts: &JobOptions, now_ms: i64, preserved_attempt: Option<u32>) -> Self {
        let delay = opts.delay.filter(|d| *d > 0).unwrap_or(0);
        Self {
            job_name: Some(name.to_string()),
            process_after: Some(now_ms.saturating_add(delay)),
            created_at: Some(now_ms),
            current_attempt: Some(preserved_attempt.unwrap_or(1)),
            max_attempts: opts.attempts,
            options: opts.clone(),
        }
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt.unwrap_or(1)
    }

    pub fn increment_attempt(&mut self) {
        self.current_attempt = Some(self.current_attempt().saturating_add(1));
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts.or(self.options.attempts)
    }

    /// Strictly greater: a job may run on its last allowed attempt.
    pub fn has_exceeded_max_attempts(&self) -> bool {
        self.max_attempts()
            .is_some_and(|max| self.current_attempt() > max)
    }

    /// Readiness predicate, inclusive at `process_after`.
    pub fn is_ready_at(&self, now_ms: i64) -> bool {
        self.process_after.map_or(true, |at| now_ms >= at)
    }

    pub fn backoff_delay(&self, attempt: u32) -> u64 {
        self.options
            .backoff
            .as_ref()
            .map_or(0, |backoff| backoff.delay_for(attempt))
    }

    pub fn priority_rank(&self) -> i64 {
        self.options.priority.unwrap_or(i64::MAX)
    }

    pub fn is_lifo(&self) -> bool {
        self.options.lifo.unwrap_or(false)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at.unwrap_or(0)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options
            .timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn should_remove_on_complete(&self) -> bool {
        self.options
            .remove_on_complete
            .is_some_and(|policy| policy.should_remove())
    }

    pub fn should_remove_on_fail(&self) -> bool {
        self.options
            .remove_on_fail
            .is_some_and(|policy| policy.should_remove())
    }

    /// Projects back to the producer shape.
    pub fn to_job_options(&self) -> JobOptions {
        let mut opts = self.options.clone();
        if opts.attempts.is_none() {
            opts.attempts = self.max_attempts;
        }
        opts
    }
}

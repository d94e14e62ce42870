//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-related errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Job options rejected at the producer boundary.
    #[error("Invalid job options: {0}")]
    Validation(String),

    /// Handler returned an error.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Handler did not settle before the job timeout.
    #[error("Job {job_id} timed out after {timeout_ms}ms")]
    Timeout { job_id: String, timeout_ms: u64 },

    /// Job was fetched after its last allowed attempt.
    #[error("Job {job_id} exceeded maximum attempts ({max_attempts})")]
    MaxAttemptsExceeded { job_id: String, max_attempts: u32 },

    /// Stored failure of a job, re-raised to a waiter.
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// Waiting for a job to finish took too long.
    #[error("Job {job_id} wait timeout after {timeout_ms}ms")]
    WaitTimeout { job_id: String, timeout_ms: u64 },

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A live job already uses the caller-supplied id.
    #[error("Job with id {0} already exists")]
    DuplicateJob(String),

    /// No factory registered for the requested driver.
    #[error("Unsupported queue driver '{driver}'. Available drivers: {available}")]
    UnsupportedDriver { driver: String, available: String },

    /// Transport failure not covered by a more specific variant.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Worker was closed and cannot be restarted.
    #[error("Worker has been closed")]
    WorkerClosed,
}

impl QueueError {
    /// Shorthand for a handler failure with the given message.
    pub fn failed(reason: impl Into<String>) -> Self {
        QueueError::ExecutionFailed(reason.into())
    }

    /// Returns true if the error came from the storage or network layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            QueueError::Transport(_)
                | QueueError::Serialization(_)
                | QueueError::Redis(_)
                | QueueError::Pool(_)
        )
    }

    /// Returns true if the caller supplied invalid input.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            QueueError::Configuration(_)
                | QueueError::Validation(_)
                | QueueError::UnsupportedDriver { .. }
                | QueueError::DuplicateJob(_)
        )
    }

    /// Text stored as a job's failure reason.
    ///
    /// Handler failures keep the handler's own message; everything else uses
    /// the full display form.
    pub fn failure_reason(&self) -> String {
        match self {
            QueueError::ExecutionFailed(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Configuration(_) => "configuration",
            QueueError::Validation(_) => "validation",
            QueueError::ExecutionFailed(_) => "execution",
            QueueError::Timeout { .. } => "timeout",
            QueueError::MaxAttemptsExceeded { .. } => "max_attempts",
            QueueError::JobFailed { .. } => "job_failed",
            QueueError::WaitTimeout { .. } => "wait_timeout",
            QueueError::NotFound(_) => "not_found",
            QueueError::DuplicateJob(_) => "duplicate",
            QueueError::UnsupportedDriver { .. } => "unsupported_driver",
            QueueError::Transport(_) => "transport",
            QueueError::Serialization(_) => "serialization",
            QueueError::Redis(_) => "redis",
            QueueError::Pool(_) => "pool",
            QueueError::WorkerClosed => "worker_closed",
        }
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(err: config::ConfigError) -> Self {
        QueueError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = QueueError::Timeout {
            job_id: "job-1".into(),
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "Job job-1 timed out after 500ms");
    }

    #[test]
    fn test_wait_timeout_display() {
        let err = QueueError::WaitTimeout {
            job_id: "job-2".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Job job-2 wait timeout after 250ms");
    }

    #[test]
    fn test_failure_reason_keeps_handler_message() {
        assert_eq!(QueueError::failed("boom").failure_reason(), "boom");
    }

    #[test]
    fn test_failure_reason_for_timeout() {
        let err = QueueError::Timeout {
            job_id: "a".into(),
            timeout_ms: 10,
        };
        assert!(err.failure_reason().contains("timed out"));
    }

    #[test]
    fn test_is_transport() {
        assert!(QueueError::Transport("down".into()).is_transport());
        assert!(!QueueError::failed("handler").is_transport());
        assert!(!QueueError::NotFound("x".into()).is_transport());
    }

    #[test]
    fn test_is_caller_error() {
        assert!(QueueError::Configuration("missing".into()).is_caller_error());
        assert!(QueueError::DuplicateJob("x".into()).is_caller_error());
        assert!(!QueueError::WorkerClosed.is_caller_error());
    }

    #[test]
    fn test_unsupported_driver_lists_available() {
        let err = QueueError::UnsupportedDriver {
            driver: "sqs".into(),
            available: "local, managed-queue".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sqs") && msg.contains("managed-queue"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(QueueError::WorkerClosed.kind(), "worker_closed");
        assert_eq!(QueueError::failed("x").kind(), "execution");
    }
}

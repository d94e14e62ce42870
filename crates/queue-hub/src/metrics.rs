//! Metrics for queue and worker monitoring.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! application.

use crate::transport::JobCounts;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "queue_hub_jobs_enqueued_total";
    /// Total jobs started by a worker.
    pub const JOBS_STARTED_TOTAL: &str = "queue_hub_jobs_started_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "queue_hub_jobs_completed_total";
    /// Total jobs failed terminally.
    pub const JOBS_FAILED_TOTAL: &str = "queue_hub_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "queue_hub_jobs_retried_total";
    /// Total attempts that hit their timeout.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "queue_hub_jobs_timed_out_total";
    /// Total jobs fetched after their last allowed attempt.
    pub const JOBS_MAX_ATTEMPTS_TOTAL: &str = "queue_hub_jobs_max_attempts_exceeded_total";

    /// Jobs per state.
    pub const JOBS_WAITING: &str = "queue_hub_jobs_waiting";
    pub const JOBS_ACTIVE: &str = "queue_hub_jobs_active";
    pub const JOBS_DELAYED: &str = "queue_hub_jobs_delayed";
    pub const JOBS_COMPLETED: &str = "queue_hub_jobs_completed";
    pub const JOBS_FAILED: &str = "queue_hub_jobs_failed";

    /// Handler execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "queue_hub_job_duration_seconds";

    /// Poll ticks that failed before reaching a handler.
    pub const POLL_ERRORS_TOTAL: &str = "queue_hub_poll_errors_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of jobs handed to a handler");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed terminally");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of attempts that timed out");
    describe_counter!(
        names::JOBS_MAX_ATTEMPTS_TOTAL,
        "Total number of jobs failed for exceeding their attempts"
    );

    describe_gauge!(names::JOBS_WAITING, "Current number of waiting jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of active jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");
    describe_gauge!(names::JOBS_COMPLETED, "Current number of retained completed jobs");
    describe_gauge!(names::JOBS_FAILED, "Current number of retained failed jobs");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job handler duration in seconds");

    describe_counter!(names::POLL_ERRORS_TOTAL, "Total number of failed poll ticks");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_enqueued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    pub fn job_started(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_STARTED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    pub fn job_completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_failed(queue: &str, job_name: &str, error_kind: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    pub fn job_timed_out(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    pub fn max_attempts_exceeded(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_MAX_ATTEMPTS_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Update queue depth gauges.
    #[allow(clippy::cast_precision_loss)]
    pub fn update_queue_depth(queue: &str, counts: &JobCounts) {
        gauge!(names::JOBS_WAITING, "queue" => queue.to_string()).set(counts.waiting as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(counts.active as f64);
        gauge!(names::JOBS_DELAYED, "queue" => queue.to_string()).set(counts.delayed as f64);
        gauge!(names::JOBS_COMPLETED, "queue" => queue.to_string()).set(counts.completed as f64);
        gauge!(names::JOBS_FAILED, "queue" => queue.to_string()).set(counts.failed as f64);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn poll_error(worker_id: &str, queue: &str, error_kind: &str) {
        counter!(
            names::POLL_ERRORS_TOTAL,
            "worker_id" => worker_id.to_string(),
            "queue" => queue.to_string(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
    }
}

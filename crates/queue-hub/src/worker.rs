//! Polling worker.
//!
//! A worker owns one recurring tick on a tokio task. Each tick fetches
//! candidates from its queue's transport, keeps the ready ones, orders them
//! by priority and LIFO/FIFO, and starts up to `concurrency` of them. The tick
//! itself never awaits a handler; executions run on a separate task so a slow
//! handler does not delay the next tick.
//!
//! ```text
//!  tick ─► fetch ─► ready? ─► order ─► take N ─┬─► exceeded? ─► failed
//!                                               └─► claim ─► run ─┬─► completed
//!                                                                 └─► retry | failed
//! ```

use crate::config::WorkerConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::{Queue, QueueEvent};
use crate::scheduling::{now_ms, plan_tick};
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Job handler: receives the job and resolves to its result value.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, QueueResult<Value>> + Send + Sync>;

/// Wraps an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(handler: F) -> JobHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<Value>> + Send + 'static,
{
    Arc::new(move |job| Box::pin(handler(job)))
}

/// Worker runtime options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Jobs started per tick.
    pub concurrency: usize,

    /// Time between ticks.
    pub polling_interval: Duration,

    /// How long fetched messages stay hidden from other consumers.
    pub visibility_timeout: Duration,

    /// Messages requested per fetch.
    pub fetch_limit: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            polling_interval: Duration::from_millis(1000),
            visibility_timeout: Duration::from_secs(30),
            fetch_limit: 20,
        }
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            polling_interval: config.polling_interval(),
            visibility_timeout: config.visibility_timeout(),
            fetch_limit: config.fetch_limit,
        }
    }
}

/// Events published by a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Active { job: Job, prev: JobState },
    Completed { job: Job, result: Value, prev: JobState },
    /// Emitted for every failed attempt, retried or not.
    Failed { job: Job, error: String, prev: JobState },
    /// Poll-level failure; the worker keeps running.
    Error { message: String },
    /// Reserved; the bundled drivers do not compute progress.
    Progress { job_id: JobId, progress: Value },
    /// Reserved; the bundled drivers do not detect stalls.
    Stalled { job_id: JobId },
    Closing,
    Closed,
}

/// Worker statistics.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: String,
    pub queue: String,
    pub running: bool,
    pub paused: bool,
    pub concurrency: usize,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub in_flight: usize,
}

struct WorkerInner {
    id: String,
    queue: Queue,
    handler: JobHandler,
    options: WorkerOptions,
    running: AtomicBool,
    paused: AtomicBool,
    closed: AtomicBool,
    events: RwLock<Option<broadcast::Sender<WorkerEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    drained: AtomicBool,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    in_flight: AtomicUsize,
}

/// Polling worker bound to one queue and one handler.
pub struct Worker {
    inner: Arc<WorkerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker. It does nothing until [`start`](Self::start).
    pub fn new(queue: Queue, handler: JobHandler, options: WorkerOptions) -> QueueResult<Self> {
        if options.concurrency == 0 {
            return Err(QueueError::Configuration(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if options.polling_interval.is_zero() {
            return Err(QueueError::Configuration(
                "worker polling interval must be positive".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(WorkerInner {
                id: format!("worker-{}", Uuid::new_v4()),
                queue,
                handler,
                options,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events: RwLock::new(Some(events)),
                shutdown_tx,
                drained: AtomicBool::new(true),
                jobs_processed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                jobs_retried: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
            }),
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.inner.options
    }

    /// Starts the polling loop. Calling it again while running is a no-op.
    pub fn start(&self) -> QueueResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::WorkerClosed);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!(worker_id = %self.inner.id, "Worker already running");
            return Ok(());
        }

        info!(
            worker_id = %self.inner.id,
            queue = %self.inner.queue.name(),
            concurrency = self.inner.options.concurrency,
            polling_interval_ms = self.inner.options.polling_interval.as_millis() as u64,
            "Starting worker"
        );

        let inner = self.inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let span = tracing::info_span!("worker", worker_id = %inner.id, queue = %inner.queue.name());

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(inner.options.polling_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick fires immediately; the first poll waits one interval.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            debug!("Received shutdown signal");
                            break;
                        }
                        _ = ticker.tick() => {
                            inner.tick().await;
                        }
                    }
                }
            }
            .instrument(span),
        );

        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Runs a single poll tick and returns how many handlers it started.
    ///
    /// Errors are returned rather than emitted.
    pub async fn poll_once(&self) -> QueueResult<usize> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::WorkerClosed);
        }
        self.inner.poll().await
    }

    /// Suppresses future ticks. In-flight handlers keep running.
    ///
    /// `force` is accepted for parity with [`close`](Self::close) and only
    /// logged: pausing never waits on a tick, so there is nothing to abort.
    pub fn pause(&self, force: bool) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(worker_id = %self.inner.id, force, "Worker paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!(worker_id = %self.inner.id, "Worker resumed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Subscribe to worker events. After close the receiver yields `Closed`.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        match self.inner.events.read().as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stops the polling loop and releases event subscribers.
    ///
    /// Without `force` a tick already in progress finishes first; with
    /// `force` it is aborted. Handlers already started keep running.
    pub async fn close(&self, force: bool) -> QueueResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(worker_id = %self.inner.id, force, "Closing worker");
        self.inner.emit(WorkerEvent::Closing);
        let _ = self.inner.shutdown_tx.send(());

        let task = self.task.lock().take();
        if let Some(handle) = task {
            if force {
                handle.abort();
            }
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(worker_id = %self.inner.id, error = %e, "Worker loop ended abnormally");
                }
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.emit(WorkerEvent::Closed);
        self.inner.events.write().take();

        info!(
            worker_id = %self.inner.id,
            processed = self.inner.jobs_processed.load(Ordering::Relaxed),
            failed = self.inner.jobs_failed.load(Ordering::Relaxed),
            "Worker closed"
        );
        Ok(())
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.inner.id.clone(),
            queue: self.inner.queue.name().to_string(),
            running: self.is_running(),
            paused: self.is_paused(),
            concurrency: self.inner.options.concurrency,
            jobs_processed: self.inner.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.inner.jobs_retried.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send(());
    }
}

impl WorkerInner {
    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = self.events.read().as_ref() {
            let _ = events.send(event);
        }
    }

    /// One scheduled tick. Poll failures are reported, never propagated.
    async fn tick(self: &Arc<Self>) {
        if let Err(e) = self.poll().await {
            error!(worker_id = %self.id, queue = %self.queue.name(), error = %e, "Poll failed");
            WorkerMetrics::poll_error(&self.id, self.queue.name(), e.kind());
            let message = e.to_string();
            self.emit(WorkerEvent::Error {
                message: message.clone(),
            });
            self.queue.emit(QueueEvent::Error { message });
        }
    }

    async fn poll(self: &Arc<Self>) -> QueueResult<usize> {
        if self.paused.load(Ordering::SeqCst) || self.queue.is_paused() {
            return Ok(0);
        }

        let transport = self.queue.transport();
        let candidates = transport
            .fetch_candidates(self.options.fetch_limit, self.options.visibility_timeout)
            .await?;

        let now = now_ms();
        let plan = plan_tick(candidates, now, self.options.concurrency);

        for record in &plan.deferred {
            let visible_at = record.opts.process_after.unwrap_or(now).max(now);
            if let Err(e) = transport.release(record, visible_at).await {
                warn!(job_id = %record.id, error = %e, "Failed to release deferred job");
            }
        }

        if plan.selected.is_empty() {
            if !self.drained.swap(true, Ordering::SeqCst) {
                self.queue.emit(QueueEvent::Drained);
            }
            return Ok(0);
        }
        self.drained.store(false, Ordering::SeqCst);

        let mut executions = Vec::with_capacity(plan.selected.len());
        for record in plan.selected {
            let mut job = Job::new(record, transport.clone());

            if job.has_exceeded_max_attempts() {
                self.fail_exhausted(job).await;
                continue;
            }

            match transport.claim(job.record()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id(), "Job claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job.id(), error = %e, "Failed to claim job");
                    continue;
                }
            }

            let prev = job.state();
            job.mark_active(now_ms());
            debug!(job_id = %job.id(), job_name = %job.name(), attempt = job.current_attempt(), "Job active");
            JobMetrics::job_started(self.queue.name(), job.name());
            self.emit(WorkerEvent::Active {
                job: job.clone(),
                prev,
            });
            self.queue.emit(QueueEvent::Active {
                job_id: job.id().clone(),
            });

            // Handlers are invoked here, in execution order.
            let run = (self.handler)(job.clone());
            executions.push(self.clone().execute(job, run));
        }

        let started = executions.len();
        if started > 0 {
            self.in_flight.fetch_add(started, Ordering::SeqCst);
            tokio::spawn(join_all(executions).in_current_span());
        }
        Ok(started)
    }

    /// Runs one attempt and routes its outcome.
    async fn execute(self: Arc<Self>, job: Job, run: BoxFuture<'static, QueueResult<Value>>) {
        let started = Instant::now();
        let mut handle = tokio::spawn(run);

        let outcome = match job.stored_options().timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => flatten_join(joined),
                Err(_) => {
                    // The handler keeps running; its result is ignored.
                    drop(handle);
                    Err(QueueError::Timeout {
                        job_id: job.id().to_string(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
            None => flatten_join(handle.await),
        };

        match outcome {
            Ok(result) => self.complete(job, result, started.elapsed()).await,
            Err(e) => self.handle_failure(job, e, started.elapsed()).await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn complete(&self, mut job: Job, result: Value, elapsed: Duration) {
        if let Err(e) = job.move_to_completed(result.clone()).await {
            error!(job_id = %job.id(), error = %e, "Failed to mark job as completed");
            return;
        }

        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_completed(self.queue.name(), job.name(), elapsed);
        debug!(job_id = %job.id(), duration_ms = elapsed.as_millis() as u64, "Job completed successfully");

        self.queue.emit(QueueEvent::Completed {
            job_id: job.id().clone(),
            result: result.clone(),
        });
        self.emit(WorkerEvent::Completed {
            job,
            result,
            prev: JobState::Active,
        });
    }

    async fn handle_failure(&self, mut job: Job, err: QueueError, elapsed: Duration) {
        let reason = err.failure_reason();
        if matches!(err, QueueError::Timeout { .. }) {
            warn!(job_id = %job.id(), error = %err, "Job timed out");
            JobMetrics::job_timed_out(self.queue.name(), job.name());
        }

        let attempt = job.current_attempt();
        match job.stored_options().max_attempts() {
            Some(max) if attempt < max => {
                let delay = job.calculate_backoff_delay(attempt);
                job.increment_attempt();
                let process_after = now_ms().saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));

                match job.reschedule_at(process_after).await {
                    Ok(()) => {
                        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::job_retried(self.queue.name(), job.name(), job.current_attempt());
                        warn!(
                            job_id = %job.id(),
                            attempt,
                            max_attempts = max,
                            backoff_ms = delay,
                            error = %reason,
                            "Job failed, retry scheduled"
                        );
                    }
                    Err(e) => {
                        error!(job_id = %job.id(), error = %e, "Failed to reschedule job");
                    }
                }
            }
            _ => {
                warn!(job_id = %job.id(), attempt, error = %reason, "Job failed");
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(self.queue.name(), job.name(), err.kind(), elapsed);
                if let Err(e) = job.move_to_failed(&reason).await {
                    error!(job_id = %job.id(), error = %e, "Failed to mark job as failed");
                }
            }
        }

        self.queue.emit(QueueEvent::Failed {
            job_id: job.id().clone(),
            reason: reason.clone(),
        });
        self.emit(WorkerEvent::Failed {
            job,
            error: reason,
            prev: JobState::Active,
        });
    }

    /// Routes a job fetched past its last attempt straight to failure.
    async fn fail_exhausted(&self, mut job: Job) {
        let max_attempts = job.stored_options().max_attempts().unwrap_or(0);
        let err = QueueError::MaxAttemptsExceeded {
            job_id: job.id().to_string(),
            max_attempts,
        };
        let reason = err.to_string();
        warn!(job_id = %job.id(), attempt = job.current_attempt(), max_attempts, "Job exceeded max attempts");

        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::max_attempts_exceeded(self.queue.name(), job.name());

        self.emit(WorkerEvent::Failed {
            job: job.clone(),
            error: reason.clone(),
            prev: JobState::Waiting,
        });
        if let Err(e) = job.move_to_failed(&reason).await {
            error!(job_id = %job.id(), error = %e, "Failed to mark job as failed");
        }
        self.queue.emit(QueueEvent::Failed {
            job_id: job.id().clone(),
            reason,
        });
    }
}

fn flatten_join(joined: Result<QueueResult<Value>, JoinError>) -> QueueResult<Value> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(QueueError::ExecutionFailed("job handler panicked".to_string())),
        Err(e) => Err(QueueError::ExecutionFailed(format!("job handler aborted: {}", e))),
    }
}

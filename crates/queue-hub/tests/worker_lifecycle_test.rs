//! Worker engine tests: retries, timeouts, ordering, events and shutdown.

mod common;

use common::{fast_options, managed_queue};
use parking_lot::Mutex;
use queue_hub::prelude::*;
use queue_hub::MemoryTransport;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

fn memory_queue(name: &str) -> Queue {
    Queue::new(name, Arc::new(MemoryTransport::new(name)), JobOptions::new()).unwrap()
}

/// Handler that records job names in start order.
fn recording_handler(order: Arc<Mutex<Vec<String>>>) -> queue_hub::JobHandler {
    handler_fn(move |job| {
        order.lock().push(job.name().to_string());
        async { Ok(json!(null)) }
    })
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no worker event within 2s")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_retries_until_success() {
    let queue = memory_queue("retries");
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_job| {
        let calls = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if calls < 3 {
                Err(QueueError::failed(format!("attempt {} failed", calls)))
            } else {
                Ok(json!("success"))
            }
        }
    });

    let job = queue
        .add(
            "flaky",
            json!(null),
            Some(JobOptions::new().attempts(3).backoff(Backoff::fixed(10))),
        )
        .await
        .unwrap();

    let worker = Worker::new(queue.clone(), handler, fast_options(1)).unwrap();
    worker.start().unwrap();
    let result = job
        .wait_until_finished(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    worker.close(false).await.unwrap();

    assert_eq!(result, json!("success"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = worker.stats();
    assert_eq!(stats.jobs_retried, 2);
    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(stats.jobs_failed, 0);
}

#[tokio::test]
async fn test_failure_without_attempts_is_final() {
    let queue = memory_queue("final");
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_job| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(QueueError::failed("boom")) }
    });

    let job = queue.add("once", json!(null), None).await.unwrap();
    let worker = Worker::new(queue.clone(), handler, fast_options(1)).unwrap();
    worker.poll_once().await.unwrap();

    let err = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::JobFailed { reason, .. } if reason == "boom"));

    // Nothing left to run.
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_fails_attempt() {
    let queue = memory_queue("timeout");
    let handler = handler_fn(|_job| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(json!("too late"))
    });

    let job = queue
        .add("slow", json!(null), Some(JobOptions::new().timeout(200)))
        .await
        .unwrap();
    let worker = Worker::new(queue.clone(), handler, fast_options(1)).unwrap();
    worker.poll_once().await.unwrap();

    let err = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    match err {
        QueueError::JobFailed { reason, .. } => {
            assert_eq!(reason, format!("Job {} timed out after 200ms", job.id()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_delayed_job_waits() {
    let queue = memory_queue("delay");
    let order = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(queue.clone(), recording_handler(order.clone()), fast_options(1)).unwrap();

    queue
        .add("later", json!(null), Some(JobOptions::new().delay(300)))
        .await
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(worker.poll_once().await.unwrap(), 1);
    assert_eq!(*order.lock(), vec!["later".to_string()]);
}

#[tokio::test]
async fn test_priority_order() {
    let queue = memory_queue("priority");
    for (name, priority) in [("p10", 10), ("p1", 1), ("p5", 5)] {
        queue
            .add(name, json!(null), Some(JobOptions::new().priority(priority)))
            .await
            .unwrap();
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(queue.clone(), recording_handler(order.clone()), fast_options(3)).unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), 3);
    assert_eq!(*order.lock(), vec!["p1", "p5", "p10"]);
}

#[tokio::test]
async fn test_lifo_order() {
    let queue = memory_queue("lifo");
    for name in ["A", "B", "C"] {
        queue
            .add(name, json!(null), Some(JobOptions::new().lifo(true)))
            .await
            .unwrap();
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(queue.clone(), recording_handler(order.clone()), fast_options(3)).unwrap();

    worker.poll_once().await.unwrap();
    assert_eq!(*order.lock(), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_concurrency_limits_each_tick() {
    let queue = memory_queue("concurrency");
    for name in ["a", "b", "c"] {
        queue.add(name, json!(null), None).await.unwrap();
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(queue.clone(), recording_handler(order.clone()), fast_options(2)).unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), 2);
    assert_eq!(*order.lock(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_exceeded_attempts_fail_without_running() {
    let queue = memory_queue("exceeded");
    let order = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(queue.clone(), recording_handler(order.clone()), fast_options(1)).unwrap();
    let mut events = worker.subscribe();

    let mut job = queue
        .add("spent", json!(null), Some(JobOptions::new().attempts(1)))
        .await
        .unwrap();
    // Second attempt on a job allowed only one.
    job.retry().await.unwrap();
    assert_eq!(job.current_attempt(), 2);

    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert!(order.lock().is_empty());

    match next_event(&mut events).await {
        WorkerEvent::Failed { job: failed, error, prev } => {
            assert_eq!(failed.id(), job.id());
            assert_eq!(prev, JobState::Waiting);
            assert!(error.contains("exceeded maximum attempts"), "unexpected reason: {error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(job.get_state().await.unwrap(), Some(JobState::Failed));
}

#[tokio::test]
async fn test_events_for_successful_job() {
    let queue = memory_queue("events");
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(7)) }),
        fast_options(1),
    )
    .unwrap();
    let mut events = worker.subscribe();
    let mut queue_events = queue.subscribe();

    let job = queue.add("seven", json!(null), None).await.unwrap();
    worker.poll_once().await.unwrap();

    match next_event(&mut events).await {
        WorkerEvent::Active { job: active, prev } => {
            assert_eq!(active.id(), job.id());
            assert_eq!(active.state(), JobState::Active);
            assert_eq!(prev, JobState::Waiting);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events).await {
        WorkerEvent::Completed { job: done, result, prev } => {
            assert_eq!(done.id(), job.id());
            assert_eq!(result, json!(7));
            assert_eq!(prev, JobState::Active);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(
        queue_events.recv().await.unwrap(),
        QueueEvent::Waiting { job_id: job.id().clone() }
    );
    assert_eq!(
        queue_events.recv().await.unwrap(),
        QueueEvent::Active { job_id: job.id().clone() }
    );
    assert_eq!(
        queue_events.recv().await.unwrap(),
        QueueEvent::Completed {
            job_id: job.id().clone(),
            result: json!(7)
        }
    );
}

#[tokio::test]
async fn test_start_is_idempotent_and_processes() {
    let queue = memory_queue("start");
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!("ok")) }),
        fast_options(1),
    )
    .unwrap();

    worker.start().unwrap();
    worker.start().unwrap();
    assert!(worker.is_running());

    let job = queue.add("a", json!(null), None).await.unwrap();
    let result = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result, json!("ok"));

    worker.close(false).await.unwrap();
    assert!(!worker.is_running());
}

#[tokio::test]
async fn test_close_emits_and_ends_stream() {
    let queue = memory_queue("close");
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();
    worker.start().unwrap();
    let mut events = worker.subscribe();

    worker.close(false).await.unwrap();

    assert!(matches!(events.recv().await, Ok(WorkerEvent::Closing)));
    assert!(matches!(events.recv().await, Ok(WorkerEvent::Closed)));
    assert!(matches!(events.recv().await, Err(RecvError::Closed)));

    // Closing twice is harmless; restarting is not allowed.
    worker.close(true).await.unwrap();
    assert!(matches!(worker.start(), Err(QueueError::WorkerClosed)));
    assert!(matches!(worker.subscribe().recv().await, Err(RecvError::Closed)));
}

#[tokio::test]
async fn test_close_does_not_cancel_in_flight_handler() {
    let queue = memory_queue("in-flight");
    let handler = handler_fn(|_job| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("finished anyway"))
    });
    let worker = Worker::new(queue.clone(), handler, fast_options(1)).unwrap();

    let job = queue.add("slow", json!(null), None).await.unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), 1);
    worker.close(true).await.unwrap();

    let result = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result, json!("finished anyway"));
}

#[tokio::test]
async fn test_paused_queue_skips_ticks() {
    let queue = memory_queue("paused");
    let order = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::new(queue.clone(), recording_handler(order.clone()), fast_options(1)).unwrap();
    queue.add("a", json!(null), None).await.unwrap();

    queue.pause();
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    queue.resume();
    assert_eq!(worker.poll_once().await.unwrap(), 1);

    worker.pause(true);
    assert!(worker.is_paused());
    queue.add("b", json!(null), None).await.unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(*order.lock(), vec!["a"]);
}

#[tokio::test]
async fn test_poll_errors_are_emitted_not_fatal() {
    let (queue, client) = managed_queue("broken");
    client.fail_fetches(true);

    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();
    let mut events = worker.subscribe();
    worker.start().unwrap();

    match next_event(&mut events).await {
        WorkerEvent::Error { message } => assert!(message.contains("service unavailable")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(worker.is_running());

    client.fail_fetches(false);
    let job = queue.add("after", json!(null), None).await.unwrap();
    let result = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result, json!(null));
    worker.close(false).await.unwrap();
}

#[tokio::test]
async fn test_drained_emitted_after_work() {
    let queue = memory_queue("drained");
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();
    let mut queue_events = queue.subscribe();

    let job = queue.add("a", json!(null), None).await.unwrap();
    worker.start().unwrap();
    job.wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match queue_events.recv().await {
                Ok(QueueEvent::Drained) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    worker.close(false).await.unwrap();
    assert!(drained);
}

//! Integration tests for the managed-queue driver over an in-process service.

mod common;

use common::{fast_options, managed_queue, FakeMessageClient};
use parking_lot::Mutex;
use queue_hub::managed::{MessageClient, OutgoingMessage, METADATA_OPTIONS};
use queue_hub::prelude::*;
use queue_hub::{DriverKind, QueueConfig, QueueFactory};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_round_trip_deletes_message() {
    let (queue, client) = managed_queue("emails");
    assert_eq!(queue.driver(), DriverKind::ManagedQueue);

    let job = queue.add("send", json!({"to": "x"}), None).await.unwrap();
    assert_eq!(client.len(), 1);

    let worker = Worker::new(
        queue.clone(),
        handler_fn(|job| async move { Ok(json!({"echo": job.data()["to"]})) }),
        fast_options(1),
    )
    .unwrap();
    worker.poll_once().await.unwrap();

    let result = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": "x"}));
    assert_eq!(client.len(), 0);

    let finished = queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(finished.state(), JobState::Completed);
    assert_eq!(queue.get_job_counts().await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_retry_preserves_public_id() {
    let (queue, client) = managed_queue("retry");
    let job = queue
        .add(
            "flaky",
            json!(null),
            Some(JobOptions::new().attempts(2).backoff(Backoff::fixed(10))),
        )
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let handler = handler_fn(move |job| {
        let seen = seen_in_handler.clone();
        async move {
            let attempt = job.current_attempt();
            seen.lock().push((job.id().to_string(), attempt));
            if attempt == 1 {
                Err(QueueError::failed("first try fails"))
            } else {
                Ok(json!("second try"))
            }
        }
    });

    let worker = Worker::new(queue.clone(), handler, fast_options(1)).unwrap();
    worker.start().unwrap();

    let result = job
        .wait_until_finished(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    worker.close(false).await.unwrap();

    assert_eq!(result, json!("second try"));
    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![(job.id().to_string(), 1), (job.id().to_string(), 2)]
    );
    assert_eq!(client.len(), 0);
}

#[tokio::test]
async fn test_duplicate_job_id_rejected() {
    let (queue, _client) = managed_queue("dedup");
    let opts = JobOptions::new().job_id("order-1");

    queue.add("a", json!(1), Some(opts.clone())).await.unwrap();
    let err = queue.add("a", json!(2), Some(opts)).await.unwrap_err();
    assert!(matches!(err, QueueError::DuplicateJob(_)));
}

#[tokio::test]
async fn test_malformed_message_degrades_to_defaults() {
    let (queue, client) = managed_queue("malformed");
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_OPTIONS.to_string(), "{not json".to_string());
    client
        .put_message(OutgoingMessage {
            id: "raw-1".to_string(),
            content: "%%% not base64 %%%".to_string(),
            metadata,
        })
        .await
        .unwrap();

    let received: Arc<Mutex<Option<(String, serde_json::Value)>>> = Arc::new(Mutex::new(None));
    let slot = received.clone();
    let worker = Worker::new(
        queue.clone(),
        handler_fn(move |job| {
            *slot.lock() = Some((job.name().to_string(), job.data().clone()));
            async { Ok(json!(null)) }
        }),
        fast_options(1),
    )
    .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    let (name, data) = received.lock().clone().unwrap();
    assert_eq!(name, "");
    assert_eq!(data, json!({}));
}

#[tokio::test]
async fn test_deferred_message_released_until_ready() {
    let (queue, client) = managed_queue("deferred");
    let job = queue
        .add("later", json!(null), Some(JobOptions::new().delay(60_000)))
        .await
        .unwrap();
    let process_after = job.stored_options().process_after.unwrap();

    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(client.visible_at(job.id().as_str()), Some(process_after));
    assert_eq!(client.len(), 1);
}

#[tokio::test]
async fn test_counts_follow_service_stats() {
    let (queue, _client) = managed_queue("counts");
    let first = queue.add("a", json!(null), None).await.unwrap();
    queue.add("b", json!(null), None).await.unwrap();
    assert_eq!(queue.get_waiting_count().await.unwrap(), 2);

    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();
    worker.poll_once().await.unwrap();
    first
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
async fn test_update_data_is_unsupported() {
    let (queue, _client) = managed_queue("immutable");
    let mut job = queue.add("a", json!(1), None).await.unwrap();
    let err = job.update(json!(2)).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_remove_jobs_by_pattern() {
    let (queue, client) = managed_queue("pattern");
    for id in ["img-1", "img-2", "doc-1"] {
        queue
            .add("x", json!(null), Some(JobOptions::new().job_id(id)))
            .await
            .unwrap();
    }

    assert_eq!(queue.remove_jobs("img-*").await.unwrap(), 2);
    assert_eq!(client.len(), 1);
    assert!(queue.get_job("doc-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_factory_requires_queue_id() {
    let client = FakeMessageClient::new();
    let factory = ManagedQueueFactory::new(move |_queue_id| {
        let client: Arc<dyn MessageClient> = client.clone();
        async move { Ok(client) }
    });

    let err = factory
        .create_queue("emails", &QueueConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Configuration(_)));

    let config = QueueConfig {
        queue_id: Some("q-emails".to_string()),
        ..QueueConfig::default()
    };
    let queue = factory.create_queue("emails", &config).await.unwrap();
    assert_eq!(queue.driver(), DriverKind::ManagedQueue);
}

#[tokio::test]
async fn test_deferred_job_stays_visible_to_lookups() {
    let (queue, client) = managed_queue("deferred-lookup");
    let job = queue
        .add("later", json!({"n": 1}), Some(JobOptions::new().delay(60_000)))
        .await
        .unwrap();
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(client.len(), 1);

    let found = queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(found.state(), JobState::Delayed);
    assert_eq!(found.data(), &json!({"n": 1}));
    assert_eq!(job.get_state().await.unwrap(), Some(JobState::Delayed));
    assert_eq!(queue.get_delayed().await.unwrap().len(), 1);

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.active, 0);

    let err = job
        .wait_until_finished(Some(Duration::from_millis(250)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::WaitTimeout { .. }));
}

#[tokio::test]
async fn test_job_in_long_backoff_is_delayed() {
    let (queue, client) = managed_queue("long-backoff");
    let job = queue
        .add(
            "flaky",
            json!(null),
            Some(JobOptions::new().attempts(2).backoff(Backoff::fixed(60_000))),
        )
        .await
        .unwrap();
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Err(QueueError::failed("service down")) }),
        fast_options(1),
    )
    .unwrap();
    let mut events = worker.subscribe();

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !matches!(events.recv().await, Ok(WorkerEvent::Failed { .. })) {}
    })
    .await
    .unwrap();

    // The next tick hides the message until the backoff ends.
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(client.len(), 1);

    let found = queue.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(found.state(), JobState::Delayed);
    assert_eq!(found.current_attempt(), 2);
    assert_eq!(job.get_state().await.unwrap(), Some(JobState::Delayed));

    let err = job
        .wait_until_finished(Some(Duration::from_millis(250)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::WaitTimeout { .. }));
}

#[tokio::test]
async fn test_retry_after_failure_runs_again() {
    let (queue, client) = managed_queue("manual-retry");
    let mut job = queue.add("once", json!(null), None).await.unwrap();
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|job| async move {
            if job.current_attempt() == 1 {
                Err(QueueError::failed("first run fails"))
            } else {
                Ok(json!("recovered"))
            }
        }),
        fast_options(1),
    )
    .unwrap();

    worker.poll_once().await.unwrap();
    let err = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::JobFailed { .. }));
    assert_eq!(client.len(), 0);

    job.retry().await.unwrap();
    assert_eq!(client.len(), 1);
    assert_eq!(job.get_state().await.unwrap(), Some(JobState::Waiting));

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    let result = job
        .wait_until_finished(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result, json!("recovered"));
    assert_eq!(client.len(), 0);
}

#[tokio::test]
async fn test_discard_deferred_job() {
    let (queue, client) = managed_queue("discard");
    let job = queue
        .add("later", json!(null), Some(JobOptions::new().delay(60_000)))
        .await
        .unwrap();
    let worker = Worker::new(
        queue.clone(),
        handler_fn(|_job| async { Ok(json!(null)) }),
        fast_options(1),
    )
    .unwrap();
    assert_eq!(worker.poll_once().await.unwrap(), 0);

    job.discard().await.unwrap();
    assert_eq!(client.len(), 0);
    assert!(queue.get_job(job.id()).await.unwrap().is_none());
    assert_eq!(job.get_state().await.unwrap(), None);
}

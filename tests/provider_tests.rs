//! Provider contract tests against the in-memory reference implementation:
//! fenced idempotent append, completion dedup, leases with expiry, peek-lock
//! queues, and delayed visibility.

use std::time::Duration;

use durafan::providers::{InMemoryProvider, Provider, ProviderError, WorkItem};
use durafan::{Event, INITIAL_EXECUTION_ID};

fn started() -> Event {
    Event::OrchestrationStarted {
        event_id: 1,
        name: "Orch".to_string(),
        input: String::new(),
        started_at_ms: 0,
    }
}

fn scheduled(event_id: u64) -> Event {
    Event::ActivityScheduled {
        event_id,
        name: "Work".to_string(),
        input: "x".to_string(),
    }
}

#[tokio::test]
async fn append_is_fenced_and_idempotent() {
    let store = InMemoryProvider::new();
    let batch = vec![started()];
    let seq = store
        .append_with_execution("i1", INITIAL_EXECUTION_ID, 0, batch.clone())
        .await
        .unwrap();
    assert_eq!(seq, 1);

    // Retrying an already-committed batch is a no-op.
    let seq = store
        .append_with_execution("i1", INITIAL_EXECUTION_ID, 0, batch)
        .await
        .unwrap();
    assert_eq!(seq, 1);

    // A stale fence carrying new events is a conflict, never an overwrite.
    let err = store
        .append_with_execution("i1", INITIAL_EXECUTION_ID, 0, vec![scheduled(2)])
        .await
        .unwrap_err();
    match &err {
        ProviderError::SequenceConflict { expected, found, .. } => {
            assert_eq!(*expected, 0);
            assert_eq!(*found, 1);
        }
        other => panic!("expected SequenceConflict, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(store.read("i1").await, vec![started()]);
}

#[tokio::test]
async fn duplicate_completion_is_recorded_at_most_once() {
    let store = InMemoryProvider::new();
    store
        .append_with_execution("i1", INITIAL_EXECUTION_ID, 0, vec![started(), scheduled(2)])
        .await
        .unwrap();
    store
        .append_with_execution(
            "i1",
            INITIAL_EXECUTION_ID,
            2,
            vec![Event::ActivityCompleted {
                event_id: 3,
                source_event_id: 2,
                result: "first".to_string(),
            }],
        )
        .await
        .unwrap();

    // A redelivered completion for the same task is dropped.
    let seq = store
        .append_with_execution(
            "i1",
            INITIAL_EXECUTION_ID,
            3,
            vec![Event::ActivityCompleted {
                event_id: 4,
                source_event_id: 2,
                result: "second".to_string(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(seq, 3);

    let history = store.read("i1").await;
    let completions: Vec<&str> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityCompleted { result, .. } => Some(result.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec!["first"]);
}

#[tokio::test]
async fn lease_blocks_other_fetchers_until_expiry() {
    let store = InMemoryProvider::new();
    store
        .enqueue_orchestrator_work(
            WorkItem::StartOrchestration {
                instance: "i1".to_string(),
                orchestration: "Orch".to_string(),
                input: String::new(),
            },
            None,
        )
        .await
        .unwrap();

    let item = store
        .fetch_orchestration_item(Duration::from_millis(60))
        .await
        .expect("first fetch claims the batch");
    assert_eq!(item.instance, "i1");
    assert_eq!(item.messages.len(), 1);

    // The lease hides the instance from concurrent coordinators.
    assert!(store
        .fetch_orchestration_item(Duration::from_millis(60))
        .await
        .is_none());

    // Expiry redelivers the batch to a new holder.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let taken = store
        .fetch_orchestration_item(Duration::from_secs(5))
        .await
        .expect("expired lease allows takeover");
    assert_eq!(taken.messages, item.messages);

    // The stale holder is fenced at commit.
    let err = store
        .ack_orchestration_item(
            &item.lock_token,
            item.execution_id,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::LockLost { .. }));
}

#[tokio::test]
async fn ack_commits_history_and_follow_up_work_atomically() {
    let store = InMemoryProvider::new();
    store
        .enqueue_orchestrator_work(
            WorkItem::StartOrchestration {
                instance: "i1".to_string(),
                orchestration: "Orch".to_string(),
                input: String::new(),
            },
            None,
        )
        .await
        .unwrap();
    let item = store
        .fetch_orchestration_item(Duration::from_secs(5))
        .await
        .unwrap();

    let work = WorkItem::ActivityExecute {
        instance: "i1".to_string(),
        execution_id: INITIAL_EXECUTION_ID,
        id: 2,
        name: "Work".to_string(),
        input: "x".to_string(),
    };
    store
        .ack_orchestration_item(
            &item.lock_token,
            item.execution_id,
            vec![started(), scheduled(2)],
            vec![work.clone()],
            Vec::new(),
            Vec::new(),
        )
        .await
        .unwrap();

    assert_eq!(store.read("i1").await, vec![started(), scheduled(2)]);
    let (dequeued, token) = store.dequeue_worker_peek_lock().await.unwrap();
    assert_eq!(dequeued, work);
    store.ack_worker(&token).await.unwrap();
    assert!(store.dequeue_worker_peek_lock().await.is_none());

    // The lease is released by the ack; a second ack is rejected.
    let err = store
        .ack_orchestration_item(
            &item.lock_token,
            item.execution_id,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::LockLost { .. }));
}

#[tokio::test]
async fn delayed_visibility_hides_work_until_due() {
    let store = InMemoryProvider::new();
    store
        .enqueue_orchestrator_work(
            WorkItem::TimerFired {
                instance: "i1".to_string(),
                execution_id: INITIAL_EXECUTION_ID,
                id: 2,
                fire_at_ms: 0,
            },
            Some(80),
        )
        .await
        .unwrap();

    assert!(store
        .fetch_orchestration_item(Duration::from_secs(5))
        .await
        .is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store
        .fetch_orchestration_item(Duration::from_secs(5))
        .await
        .is_some());
}

#[tokio::test]
async fn worker_queue_dedups_and_redelivers_on_abandon() {
    let store = InMemoryProvider::new();
    let work = WorkItem::ActivityExecute {
        instance: "i1".to_string(),
        execution_id: INITIAL_EXECUTION_ID,
        id: 2,
        name: "Work".to_string(),
        input: "x".to_string(),
    };
    store.enqueue_worker_work(work.clone()).await.unwrap();
    store.enqueue_worker_work(work.clone()).await.unwrap();

    let (first, token) = store.dequeue_worker_peek_lock().await.unwrap();
    assert_eq!(first, work);
    assert!(
        store.dequeue_worker_peek_lock().await.is_none(),
        "duplicate enqueue must not produce a second item"
    );

    // Abandon puts the item back at the front of the queue.
    store.abandon_worker(&token).await.unwrap();
    let (redelivered, token) = store.dequeue_worker_peek_lock().await.unwrap();
    assert_eq!(redelivered, work);
    store.ack_worker(&token).await.unwrap();
}

#[tokio::test]
async fn abandoned_orchestration_batch_is_redelivered_after_delay() {
    let store = InMemoryProvider::new();
    store
        .enqueue_orchestrator_work(
            WorkItem::StartOrchestration {
                instance: "i1".to_string(),
                orchestration: "Orch".to_string(),
                input: String::new(),
            },
            None,
        )
        .await
        .unwrap();
    let item = store
        .fetch_orchestration_item(Duration::from_secs(5))
        .await
        .unwrap();

    store
        .abandon_orchestration_item(&item.lock_token, Some(50))
        .await
        .unwrap();
    assert!(
        store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .is_none(),
        "redelivery delay must hide the batch"
    );
    tokio::time::sleep(Duration::from_millis(70)).await;
    let redelivered = store
        .fetch_orchestration_item(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(redelivered.messages, item.messages);
}

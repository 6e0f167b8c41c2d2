//! Storage seam: durable history plus the three work queues.
//!
//! A [`Provider`] is the engine's single source of truth. History is
//! append-only per instance and per execution, fenced by a monotonically
//! increasing sequence number; coordination happens through optimistic append
//! plus a per-instance lease, never a distributed lock. Implementations are
//! datastores only; the runtime owns dispatch and workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Event;

/// In-memory reference provider.
pub mod in_memory;

pub use in_memory::InMemoryProvider;

/// Message flowing through a provider queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
    },
}

impl WorkItem {
    /// Instance this message belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => instance,
        }
    }
}

/// One leased unit of coordinator work: an instance's current history plus
/// the batch of messages that arrived for it.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub execution_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Provider failure taxonomy with retry classification.
///
/// `Unavailable` is transient and worth retrying with backoff. A
/// `SequenceConflict` means another writer committed first: reload and
/// re-decide, never blind-overwrite. `LockLost` means the lease expired or
/// was taken over; the holder's work must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("sequence conflict on {instance}#{execution_id}: expected {expected}, found {found}")]
    SequenceConflict {
        instance: String,
        execution_id: u64,
        expected: u64,
        found: u64,
    },

    #[error("lock token no longer valid: {token}")]
    LockLost { token: String },

    #[error("{operation} failed: {message}")]
    Permanent { operation: String, message: String },
}

impl ProviderError {
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable { .. })
    }
}

/// Durable history store plus orchestrator/worker/timer queues.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Read the latest execution's history for an instance.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Read a specific execution's history.
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;

    /// Latest execution id for an instance, if it exists.
    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Vec<String>;

    /// Append events atomically, fenced by the expected current length of the
    /// execution's history. Re-appending an already-committed batch is a
    /// no-op; a fence mismatch is a [`ProviderError::SequenceConflict`].
    /// Duplicate completion events for an already-completed task are dropped,
    /// never overwritten. Returns the new sequence number.
    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError>;

    /// Enqueue a message for the coordinator, optionally invisible for
    /// `visible_in_ms` (timer firings, retry redelivery).
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        visible_in_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    /// Enqueue an activity work item. Enqueueing an identical item twice is
    /// deduplicated.
    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Enqueue a timer schedule.
    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Atomically claim the next instance with visible messages: acquires a
    /// lease (`lease` duration, token in the returned item) and drains the
    /// instance's visible messages into one batch. Returns `None` when no
    /// work is visible.
    async fn fetch_orchestration_item(&self, lease: Duration) -> Option<OrchestrationItem>;

    /// Commit a turn atomically: append the history delta (fenced), enqueue
    /// follow-up work, release the lease. Fails with [`ProviderError::LockLost`]
    /// if the lease expired, leaving the batch to be redelivered.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release the lease without committing; the batch becomes visible again
    /// after `redeliver_in_ms`.
    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        redeliver_in_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    /// Peek-lock the next activity work item.
    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)>;

    /// Acknowledge (delete) a worker item.
    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError>;

    /// Return a worker item to the queue.
    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError>;

    /// Peek-lock the next timer schedule.
    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)>;

    /// Acknowledge (delete) a timer item.
    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError>;

    /// Block until orchestrator work may be visible, or `timeout`. The
    /// default is a plain sleep; providers with wake support override this so
    /// dispatchers are event-driven instead of hot-polling.
    async fn wait_for_orchestrator_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Same as [`wait_for_orchestrator_work`](Self::wait_for_orchestrator_work)
    /// for the worker queue.
    async fn wait_for_worker_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    /// Same as [`wait_for_orchestrator_work`](Self::wait_for_orchestrator_work)
    /// for the timer queue.
    async fn wait_for_timer_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

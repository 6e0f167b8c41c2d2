//! In-memory provider: reference implementation of the [`Provider`] contract.
//!
//! Durability is process-lifetime only, which is enough for tests and local
//! development; the coordination semantics (fenced append, leases, peek-lock,
//! delayed visibility) are the real contract and match what a durable
//! implementation must provide.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::warn;

use super::{OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::{wall_clock_ms, Event, INITIAL_EXECUTION_ID};

struct Queued {
    item: WorkItem,
    visible_at_ms: u64,
}

struct InstanceLock {
    instance: String,
    execution_id: u64,
    /// History length of the leased execution at fetch time; the ack fence.
    fenced_seq: u64,
    expires_at_ms: u64,
    messages: Vec<WorkItem>,
}

#[derive(Default)]
struct State {
    /// instance -> executions (execution_id starts at 1).
    instances: HashMap<String, Vec<Vec<Event>>>,
    orchestrator_q: Vec<Queued>,
    worker_q: Vec<Queued>,
    timer_q: Vec<Queued>,
    /// lock token -> lease.
    locks: HashMap<String, InstanceLock>,
    /// instance -> lock token currently holding its lease.
    locked_instances: HashMap<String, String>,
    invisible_worker: HashMap<String, WorkItem>,
    invisible_timer: HashMap<String, WorkItem>,
    token_counter: u64,
}

impl State {
    /// Release expired leases and make their undelivered batches visible
    /// again, allowing takeover after a coordinator crash.
    fn expire_stale_locks(&mut self, now_ms: u64) {
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.expires_at_ms <= now_ms)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(lock) = self.locks.remove(&token) {
                warn!(instance = %lock.instance, token = %token, "lease expired; redelivering batch");
                self.locked_instances.remove(&lock.instance);
                for item in lock.messages.into_iter().rev() {
                    self.orchestrator_q.insert(
                        0,
                        Queued {
                            item,
                            visible_at_ms: now_ms,
                        },
                    );
                }
            }
        }
    }

    fn next_token(&mut self, prefix: &str) -> String {
        self.token_counter += 1;
        format!("{prefix}:{}", self.token_counter)
    }

    /// Earliest moment anything on the orchestrator queue can become
    /// actionable: a delayed item turning visible or a lease expiring.
    fn next_orchestrator_wake_ms(&self, now_ms: u64) -> Option<u64> {
        let queue = self
            .orchestrator_q
            .iter()
            .map(|q| q.visible_at_ms)
            .filter(|at| *at > now_ms)
            .min();
        let lease = self.locks.values().map(|l| l.expires_at_ms).min();
        match (queue, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Append `events`, dropping duplicate completions for tasks that already
/// have a terminal completion recorded. A task id gets at most one
/// completion; later deliveries are discarded, never overwrite.
fn append_events(instance: &str, history: &mut Vec<Event>, events: Vec<Event>) {
    for event in events {
        if let Some(source) = event.completion_source() {
            let duplicate = history
                .iter()
                .any(|recorded| recorded.completion_source() == Some(source));
            if duplicate {
                warn!(
                    instance,
                    source_event_id = source,
                    "duplicate completion discarded"
                );
                continue;
            }
        }
        history.push(event);
    }
}

#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    orchestrator_notify: Notify,
    worker_notify: Notify,
    timer_notify: Notify,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state (test utility).
    pub async fn reset(&self) {
        let mut s = self.state.lock().await;
        *s = State::default();
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let s = self.state.lock().await;
        s.instances
            .get(instance)
            .and_then(|execs| execs.last())
            .cloned()
            .unwrap_or_default()
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let s = self.state.lock().await;
        s.instances
            .get(instance)
            .and_then(|execs| execs.get(execution_id.saturating_sub(1) as usize))
            .cloned()
            .unwrap_or_default()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let s = self.state.lock().await;
        s.instances
            .get(instance)
            .filter(|execs| !execs.is_empty())
            .map(|execs| execs.len() as u64)
    }

    async fn list_instances(&self) -> Vec<String> {
        let s = self.state.lock().await;
        s.instances.keys().cloned().collect()
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        expected_seq: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let mut s = self.state.lock().await;
        let execs = s.instances.entry(instance.to_string()).or_default();
        if execs.is_empty() && execution_id == INITIAL_EXECUTION_ID {
            execs.push(Vec::new());
        }
        let index = execution_id.saturating_sub(1) as usize;
        let history = execs.get_mut(index).ok_or_else(|| {
            ProviderError::permanent(
                "append_with_execution",
                format!("execution not found: {instance}#{execution_id}"),
            )
        })?;
        let current_seq = history.len() as u64;
        if expected_seq == current_seq {
            append_events(instance, history, events);
            return Ok(history.len() as u64);
        }
        if expected_seq < current_seq {
            // Retried append of a batch that already committed is a no-op.
            let already_committed = events
                .iter()
                .all(|e| history.iter().any(|h| h.event_id() == e.event_id()));
            if already_committed {
                return Ok(current_seq);
            }
        }
        Err(ProviderError::SequenceConflict {
            instance: instance.to_string(),
            execution_id,
            expected: expected_seq,
            found: current_seq,
        })
    }

    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        visible_in_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        if !s.orchestrator_q.iter().any(|q| q.item == item) {
            let visible_at_ms = wall_clock_ms() + visible_in_ms.unwrap_or(0);
            s.orchestrator_q.push(Queued {
                item,
                visible_at_ms,
            });
        }
        drop(s);
        self.orchestrator_notify.notify_one();
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        if !s.worker_q.iter().any(|q| q.item == item) {
            s.worker_q.push(Queued {
                item,
                visible_at_ms: wall_clock_ms(),
            });
        }
        drop(s);
        self.worker_notify.notify_one();
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        if !s.timer_q.iter().any(|q| q.item == item) {
            s.timer_q.push(Queued {
                item,
                visible_at_ms: wall_clock_ms(),
            });
        }
        drop(s);
        self.timer_notify.notify_one();
        Ok(())
    }

    async fn fetch_orchestration_item(&self, lease: Duration) -> Option<OrchestrationItem> {
        let now = wall_clock_ms();
        let mut s = self.state.lock().await;
        s.expire_stale_locks(now);

        let position = s.orchestrator_q.iter().position(|q| {
            q.visible_at_ms <= now && !s.locked_instances.contains_key(q.item.instance())
        })?;
        let instance = s.orchestrator_q[position].item.instance().to_string();

        // Batch every visible message for the chosen instance into one turn.
        let mut messages = Vec::new();
        let mut i = 0;
        while i < s.orchestrator_q.len() {
            if s.orchestrator_q[i].item.instance() == instance
                && s.orchestrator_q[i].visible_at_ms <= now
            {
                messages.push(s.orchestrator_q.remove(i).item);
            } else {
                i += 1;
            }
        }

        let execution_id = s
            .instances
            .get(&instance)
            .filter(|execs| !execs.is_empty())
            .map(|execs| execs.len() as u64)
            .unwrap_or(INITIAL_EXECUTION_ID);
        let history = s
            .instances
            .get(&instance)
            .and_then(|execs| execs.last())
            .cloned()
            .unwrap_or_default();

        let token = s.next_token("orch");
        s.locks.insert(
            token.clone(),
            InstanceLock {
                instance: instance.clone(),
                execution_id,
                fenced_seq: history.len() as u64,
                expires_at_ms: now + lease.as_millis() as u64,
                messages: messages.clone(),
            },
        );
        s.locked_instances.insert(instance.clone(), token.clone());

        Some(OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token: token,
        })
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let now = wall_clock_ms();
        let mut s = self.state.lock().await;

        let valid = s
            .locks
            .get(lock_token)
            .map(|lock| lock.expires_at_ms > now)
            .unwrap_or(false);
        if !valid {
            s.expire_stale_locks(now);
            return Err(ProviderError::LockLost {
                token: lock_token.to_string(),
            });
        }
        let lock = s.locks.get(lock_token).expect("validated above");
        let lock_instance = lock.instance.clone();
        let lock_execution_id = lock.execution_id;
        let fenced_seq = lock.fenced_seq;

        let execs = s.instances.entry(lock_instance.clone()).or_default();
        if execution_id == lock_execution_id {
            if execs.is_empty() {
                execs.push(Vec::new());
            }
            let index = execution_id.saturating_sub(1) as usize;
            let history = execs.get_mut(index).ok_or_else(|| {
                ProviderError::permanent(
                    "ack_orchestration_item",
                    format!("execution not found: {lock_instance}#{execution_id}"),
                )
            })?;
            if history.len() as u64 != fenced_seq {
                return Err(ProviderError::SequenceConflict {
                    instance: lock_instance,
                    execution_id,
                    expected: fenced_seq,
                    found: history.len() as u64,
                });
            }
            append_events(&lock_instance, history, history_delta);
        } else if execution_id == lock_execution_id + 1 {
            // Continue-as-new: archive the old execution, start fresh.
            let mut history = Vec::new();
            append_events(&lock_instance, &mut history, history_delta);
            execs.push(history);
        } else {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                format!(
                    "unexpected execution id {execution_id} (leased {lock_execution_id})"
                ),
            ));
        }

        for item in worker_items {
            if !s.worker_q.iter().any(|q| q.item == item) {
                s.worker_q.push(Queued {
                    item,
                    visible_at_ms: now,
                });
            }
        }
        for item in timer_items {
            if !s.timer_q.iter().any(|q| q.item == item) {
                s.timer_q.push(Queued {
                    item,
                    visible_at_ms: now,
                });
            }
        }
        for item in orchestrator_items {
            if !s.orchestrator_q.iter().any(|q| q.item == item) {
                s.orchestrator_q.push(Queued {
                    item,
                    visible_at_ms: now,
                });
            }
        }

        s.locks.remove(lock_token);
        s.locked_instances.remove(&lock_instance);
        drop(s);
        self.orchestrator_notify.notify_one();
        self.worker_notify.notify_one();
        self.timer_notify.notify_one();
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        redeliver_in_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let now = wall_clock_ms();
        let mut s = self.state.lock().await;
        let lock = s.locks.remove(lock_token).ok_or(ProviderError::LockLost {
            token: lock_token.to_string(),
        })?;
        s.locked_instances.remove(&lock.instance);
        let visible_at_ms = now + redeliver_in_ms.unwrap_or(0);
        for item in lock.messages.into_iter().rev() {
            s.orchestrator_q.insert(
                0,
                Queued {
                    item,
                    visible_at_ms,
                },
            );
        }
        drop(s);
        self.orchestrator_notify.notify_one();
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let now = wall_clock_ms();
        let mut s = self.state.lock().await;
        let position = s.worker_q.iter().position(|q| q.visible_at_ms <= now)?;
        let item = s.worker_q.remove(position).item;
        let token = s.next_token("work");
        s.invisible_worker.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.invisible_worker.remove(token);
        Ok(())
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        if let Some(item) = s.invisible_worker.remove(token) {
            s.worker_q.insert(
                0,
                Queued {
                    item,
                    visible_at_ms: wall_clock_ms(),
                },
            );
        }
        drop(s);
        self.worker_notify.notify_one();
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let now = wall_clock_ms();
        let mut s = self.state.lock().await;
        let position = s.timer_q.iter().position(|q| q.visible_at_ms <= now)?;
        let item = s.timer_q.remove(position).item;
        let token = s.next_token("timer");
        s.invisible_timer.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.invisible_timer.remove(token);
        Ok(())
    }

    async fn wait_for_orchestrator_work(&self, timeout: Duration) {
        let now = wall_clock_ms();
        let cap = {
            let s = self.state.lock().await;
            s.next_orchestrator_wake_ms(now)
                .map(|at| Duration::from_millis(at.saturating_sub(now)))
                .unwrap_or(timeout)
                .min(timeout)
        };
        tokio::select! {
            _ = self.orchestrator_notify.notified() => {}
            _ = tokio::time::sleep(cap) => {}
        }
    }

    async fn wait_for_worker_work(&self, timeout: Duration) {
        tokio::select! {
            _ = self.worker_notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    async fn wait_for_timer_work(&self, timeout: Duration) {
        tokio::select! {
            _ = self.timer_notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

//! Replay-aware futures for orchestration primitives.
//!
//! A [`TaskFuture`] does two things when polled. First, it claims its
//! scheduling event: the next unconsumed scheduling event in history must
//! match this call (replay), otherwise the call is genuinely new and a fresh
//! event plus outbound action are recorded. Second, it looks for the
//! completion event correlated to its scheduling id and consumes it under a
//! global FIFO gate: a completion is only consumable once every completion
//! before it in history has been consumed (or belongs to a cancelled select
//! loser). The gate is what makes select winners and interleaved awaits
//! replay identically regardless of wall-clock arrival order.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Claim, Event, OrchestrationContext, SchedulingRequest};

/// Output of a single orchestration task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

/// Future for one scheduled activity, timer, or external-event subscription.
#[must_use = "futures do nothing unless awaited"]
pub struct TaskFuture(pub(crate) FutureKind);

pub(crate) enum FutureKind {
    Activity {
        name: String,
        input: String,
        claimed: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    Timer {
        delay_ms: u64,
        claimed: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    External {
        name: String,
        claimed: Cell<Option<u64>>,
        cached: RefCell<Option<String>>,
        ctx: OrchestrationContext,
    },
}

impl TaskFuture {
    /// Narrow to an activity result future.
    pub fn into_activity(self) -> ActivityFuture {
        ActivityFuture(self)
    }

    /// Narrow to a timer future.
    pub fn into_timer(self) -> TimerFuture {
        TimerFuture(self)
    }

    /// Narrow to an external-event future.
    pub fn into_event(self) -> ExternalFuture {
        ExternalFuture(self)
    }

    pub(crate) fn describe(&self) -> String {
        match &self.0 {
            FutureKind::Activity { name, .. } => format!("activity '{name}'"),
            FutureKind::Timer { .. } => "timer".to_string(),
            FutureKind::External { name, .. } => format!("external event '{name}'"),
        }
    }

    pub(crate) fn claimed_event_id(&self) -> Option<u64> {
        match &self.0 {
            FutureKind::Activity { claimed, .. }
            | FutureKind::Timer { claimed, .. }
            | FutureKind::External { claimed, .. } => claimed.get(),
        }
    }
}

impl Future for TaskFuture {
    type Output = TaskOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            FutureKind::Activity {
                name,
                input,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_scheduling(&SchedulingRequest::Activity { name, input }) {
                        Claim::Existing(id) => claimed.set(Some(id)),
                        Claim::Mismatch => return Poll::Pending,
                        Claim::New => {
                            let id = inner.allocate_event_id();
                            inner.history.push(Event::ActivityScheduled {
                                event_id: id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                            inner.record_action(Action::CallActivity {
                                scheduling_event_id: id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                            claimed.set(Some(id));
                        }
                    }
                }
                let source = claimed.get().expect("scheduling event claimed above");

                let completion = inner.history.iter().find_map(|e| match e {
                    Event::ActivityCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == source => Some((*event_id, Ok(result.clone()))),
                    Event::ActivityFailed {
                        event_id,
                        source_event_id,
                        error,
                    } if *source_event_id == source => Some((*event_id, Err(error.clone()))),
                    _ => None,
                });
                if let Some((completion_event_id, result)) = completion {
                    if inner.can_consume_completion(completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(TaskOutput::Activity(result));
                    }
                }
                Poll::Pending
            }
            FutureKind::Timer {
                delay_ms,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_scheduling(&SchedulingRequest::Timer) {
                        Claim::Existing(id) => claimed.set(Some(id)),
                        Claim::Mismatch => return Poll::Pending,
                        Claim::New => {
                            let id = inner.allocate_event_id();
                            // Captured once on the recording pass; replay reads
                            // the event, never the clock.
                            let fire_at_ms = crate::wall_clock_ms()
                                .max(inner.now_ms())
                                .saturating_add(*delay_ms);
                            inner.history.push(Event::TimerCreated {
                                event_id: id,
                                fire_at_ms,
                            });
                            inner.record_action(Action::CreateTimer {
                                scheduling_event_id: id,
                                fire_at_ms,
                            });
                            claimed.set(Some(id));
                        }
                    }
                }
                let source = claimed.get().expect("scheduling event claimed above");

                let completion = inner.history.iter().find_map(|e| match e {
                    Event::TimerFired {
                        event_id,
                        source_event_id,
                        fire_at_ms,
                    } if *source_event_id == source => Some((*event_id, *fire_at_ms)),
                    _ => None,
                });
                if let Some((completion_event_id, fire_at_ms)) = completion {
                    if inner.can_consume_completion(completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        inner.advance_time(fire_at_ms);
                        return Poll::Ready(TaskOutput::Timer);
                    }
                }
                Poll::Pending
            }
            FutureKind::External {
                name,
                claimed,
                cached,
                ctx,
            } => {
                if let Some(data) = cached.borrow().clone() {
                    return Poll::Ready(TaskOutput::External(data));
                }
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_scheduling(&SchedulingRequest::External { name }) {
                        Claim::Existing(id) => claimed.set(Some(id)),
                        Claim::Mismatch => return Poll::Pending,
                        Claim::New => {
                            let id = inner.allocate_event_id();
                            inner.history.push(Event::ExternalSubscribed {
                                event_id: id,
                                name: name.clone(),
                            });
                            inner.record_action(Action::WaitExternal {
                                scheduling_event_id: id,
                                name: name.clone(),
                            });
                            claimed.set(Some(id));
                        }
                    }
                }

                // External deliveries carry no source id; match by name in
                // arrival order.
                if !inner.consumed_external_events.contains(name) {
                    let delivery = inner.history.iter().find_map(|e| match e {
                        Event::ExternalEvent {
                            event_id,
                            name: delivered,
                            data,
                        } if delivered == name
                            && !inner.consumed_completions.contains(event_id) =>
                        {
                            Some((*event_id, data.clone()))
                        }
                        _ => None,
                    });
                    if let Some((completion_event_id, data)) = delivery {
                        if inner.can_consume_completion(completion_event_id) {
                            inner.consumed_completions.insert(completion_event_id);
                            inner.consumed_external_events.insert(name.clone());
                            *cached.borrow_mut() = Some(data.clone());
                            return Poll::Ready(TaskOutput::External(data));
                        }
                    }
                }
                Poll::Pending
            }
        }
    }
}

/// Typed view over [`TaskFuture`] resolving to an activity result.
#[must_use = "futures do nothing unless awaited"]
pub struct ActivityFuture(TaskFuture);

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(TaskOutput::Activity(result)) => Poll::Ready(result),
            Poll::Ready(other) => unreachable!("activity future resolved to {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Typed view over [`TaskFuture`] resolving when the timer fires.
#[must_use = "futures do nothing unless awaited"]
pub struct TimerFuture(TaskFuture);

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(TaskOutput::Timer) => Poll::Ready(()),
            Poll::Ready(other) => unreachable!("timer future resolved to {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Typed view over [`TaskFuture`] resolving to external event data.
#[must_use = "futures do nothing unless awaited"]
pub struct ExternalFuture(TaskFuture);

impl Future for ExternalFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(TaskOutput::External(data)) => Poll::Ready(data),
            Poll::Ready(other) => unreachable!("external future resolved to {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// ALL-mode fan-in barrier over a set of task futures.
///
/// Resolves once every child has a terminal completion in history. Outputs
/// come back in submission order, not completion order: index `i` of the
/// result is child `i`, whatever the wall-clock interleaving was. Polling
/// runs to a fixed point so one newly consumable completion can cascade into
/// the next under the FIFO gate.
#[must_use = "futures do nothing unless awaited"]
pub struct JoinFuture {
    children: Vec<TaskFuture>,
    results: Vec<Option<TaskOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<TaskFuture>) -> Self {
        let results = (0..children.len()).map(|_| None).collect();
        Self { children, results }
    }
}

impl Future for JoinFuture {
    type Output = Vec<TaskOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            let mut made_progress = false;
            for (i, child) in this.children.iter_mut().enumerate() {
                if this.results[i].is_some() {
                    continue;
                }
                if let Poll::Ready(output) = Pin::new(child).poll(cx) {
                    this.results[i] = Some(output);
                    made_progress = true;
                }
            }
            if this.results.iter().all(Option::is_some) {
                let outputs = this
                    .results
                    .iter_mut()
                    .map(|r| r.take().expect("all results present"))
                    .collect();
                return Poll::Ready(outputs);
            }
            if !made_progress {
                return Poll::Pending;
            }
        }
    }
}

/// ANY-mode race over a set of task futures.
///
/// Every child is polled each pass so all of them claim their scheduling
/// events (required for deterministic id assignment even when the winner is
/// already known from history). The FIFO gate guarantees the first child to
/// go ready is the earliest completion in history order, so replays pick the
/// same winner. Losers are marked cancelled: their completions stop gating
/// FIFO consumption, but the underlying work is not killed.
#[must_use = "futures do nothing unless awaited"]
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<TaskFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<TaskFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, TaskOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut winner: Option<(usize, TaskOutput)> = None;
        for (i, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(output) = Pin::new(child).poll(cx) {
                if winner.is_none() {
                    winner = Some((i, output));
                }
            }
        }
        if let Some((winner_index, output)) = winner {
            let mut inner = this.ctx.inner.lock().unwrap();
            for (i, child) in this.children.iter().enumerate() {
                if i == winner_index {
                    continue;
                }
                if let Some(source_id) = child.claimed_event_id() {
                    inner.cancelled_source_ids.insert(source_id);
                }
            }
            return Poll::Ready((winner_index, output));
        }
        Poll::Pending
    }
}

//! Deterministic-replay orchestration engine with durable fan-out/fan-in.
//!
//! Orchestrator code is an async function over an [`OrchestrationContext`].
//! Every side-effecting primitive (`schedule_activity`, `schedule_timer`,
//! `schedule_wait`, ...) is recorded as an event in an append-only history;
//! re-running the orchestrator against that history reconstructs its state
//! without re-executing completed work. Activities run on an independent
//! worker pool; [`OrchestrationContext::join`] re-imposes submission order at
//! fan-in.
//!
//! The engine never calls ambient non-deterministic APIs from orchestrator
//! code: wall-clock reads, guids and log emission go through context
//! primitives whose results are captured in history and replayed verbatim.

pub mod client;
mod codec;
pub mod futures;
pub mod providers;
pub mod retry;
pub mod runtime;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::futures::FutureKind;
pub use crate::futures::{
    ActivityFuture, ExternalFuture, JoinFuture, SelectFuture, TaskFuture, TaskOutput, TimerFuture,
};
pub use client::Client;
pub use codec::{Codec, Json};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions, WaitError};

/// First event id assigned within an execution.
pub const INITIAL_EVENT_ID: u64 = 1;
/// First execution id of an instance; continue-as-new increments it.
pub const INITIAL_EXECUTION_ID: u64 = 1;

pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_UTCNOW_MS: &str = "utcnow_ms";
pub(crate) const SYSCALL_OP_TRACE_PREFIX: &str = "trace:";

/// One entry in an instance's append-only history.
///
/// `event_id` is unique within an execution and assigned monotonically.
/// Scheduling events double as task ids: a completion correlates back to its
/// scheduling event through `source_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        input: String,
        started_at_ms: u64,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    ExternalEvent {
        event_id: u64,
        name: String,
        data: String,
    },
    SystemCall {
        event_id: u64,
        op: String,
        value: String,
    },
    CustomStatusSet {
        event_id: u64,
        status: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        error: String,
    },
    OrchestrationCancelled {
        event_id: u64,
        reason: String,
    },
    OrchestrationContinuedAsNew {
        event_id: u64,
        input: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::CustomStatusSet { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationCancelled { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. } => *event_id,
        }
    }

    /// Scheduling event id this completion correlates to, if any.
    pub(crate) fn completion_source(&self) -> Option<u64> {
        match self {
            Event::ActivityCompleted {
                source_event_id, ..
            }
            | Event::ActivityFailed {
                source_event_id, ..
            }
            | Event::TimerFired {
                source_event_id, ..
            } => Some(*source_event_id),
            _ => None,
        }
    }
}

/// Outbound decision produced by one replay pass.
///
/// Actions are only emitted for scheduling events appended during the current
/// turn; replayed events never re-emit their action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    ContinueAsNew {
        input: String,
    },
}

/// What the orchestrator asked for at a scheduling call site, used to match
/// the call against the next unconsumed scheduling event in history.
pub(crate) enum SchedulingRequest<'a> {
    Activity { name: &'a str, input: &'a str },
    Timer,
    External { name: &'a str },
}

impl std::fmt::Display for SchedulingRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingRequest::Activity { name, input } => {
                write!(f, "activity '{name}' with input '{input}'")
            }
            SchedulingRequest::Timer => write!(f, "timer"),
            SchedulingRequest::External { name } => write!(f, "external subscription '{name}'"),
        }
    }
}

pub(crate) enum Claim {
    /// Matched a scheduling event already in history (replay).
    Existing(u64),
    /// History has an unconsumed scheduling event of a different shape; the
    /// nondeterminism error has been recorded.
    Mismatch,
    /// No unconsumed scheduling event remains; this call is genuinely new.
    New,
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) execution_id: u64,
    pub(crate) history: Vec<Event>,
    /// History length before this turn's new decisions.
    baseline_len: usize,
    next_event_id: u64,
    /// Scheduling/system-call/custom-status events matched by a primitive
    /// call this replay pass.
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) consumed_external_events: HashSet<String>,
    /// Losers of a resolved select; their completions no longer gate FIFO
    /// consumption.
    pub(crate) cancelled_source_ids: HashSet<u64>,
    actions: Vec<Action>,
    pub(crate) nondeterminism_error: Option<String>,
    custom_status: Option<String>,
    /// Orchestration logical time: start time advanced by consumed timers.
    current_time_ms: u64,
}

impl CtxInner {
    fn new(instance_id: String, execution_id: u64, history: Vec<Event>) -> Self {
        let next_event_id = history
            .iter()
            .map(Event::event_id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(INITIAL_EVENT_ID);
        let current_time_ms = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { started_at_ms, .. } => Some(*started_at_ms),
                _ => None,
            })
            .unwrap_or(0);
        let custom_status = history.iter().rev().find_map(|e| match e {
            Event::CustomStatusSet { status, .. } => Some(status.clone()),
            _ => None,
        });
        Self {
            instance_id,
            execution_id,
            baseline_len: history.len(),
            next_event_id,
            history,
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            consumed_external_events: HashSet::new(),
            cancelled_source_ids: HashSet::new(),
            actions: Vec::new(),
            nondeterminism_error: None,
            custom_status,
            current_time_ms,
        }
    }

    pub(crate) fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.current_time_ms
    }

    pub(crate) fn advance_time(&mut self, to_ms: u64) {
        if to_ms > self.current_time_ms {
            self.current_time_ms = to_ms;
        }
    }

    /// Match a scheduling call against the next unconsumed scheduling event.
    ///
    /// Replay contract: scheduling calls must re-occur in the exact order
    /// history recorded them. The first unconsumed scheduling event either
    /// matches this request or the orchestrator has diverged.
    pub(crate) fn claim_scheduling(&mut self, request: &SchedulingRequest<'_>) -> Claim {
        let mut verdict = None;
        for event in &self.history {
            let (event_id, matched, found) = match event {
                Event::ActivityScheduled {
                    event_id,
                    name,
                    input,
                } if !self.claimed_scheduling_events.contains(event_id) => {
                    let matched = matches!(
                        request,
                        SchedulingRequest::Activity { name: n, input: i } if n == name && i == input
                    );
                    (
                        *event_id,
                        matched,
                        format!("activity '{name}' with input '{input}'"),
                    )
                }
                Event::TimerCreated { event_id, .. }
                    if !self.claimed_scheduling_events.contains(event_id) =>
                {
                    (
                        *event_id,
                        matches!(request, SchedulingRequest::Timer),
                        "timer".to_string(),
                    )
                }
                Event::ExternalSubscribed { event_id, name }
                    if !self.claimed_scheduling_events.contains(event_id) =>
                {
                    let matched = matches!(
                        request,
                        SchedulingRequest::External { name: n } if n == name
                    );
                    (
                        *event_id,
                        matched,
                        format!("external subscription '{name}'"),
                    )
                }
                _ => continue,
            };
            verdict = Some((event_id, matched, found));
            break;
        }

        match verdict {
            Some((event_id, true, _)) => {
                self.claimed_scheduling_events.insert(event_id);
                Claim::Existing(event_id)
            }
            Some((_, false, found)) => {
                self.nondeterminism_error = Some(format!(
                    "schedule order mismatch: history recorded {found} but orchestrator requested {request}"
                ));
                Claim::Mismatch
            }
            None => Claim::New,
        }
    }

    /// A completion may only be consumed once every completion before it in
    /// history has been consumed or belongs to a cancelled select loser.
    pub(crate) fn can_consume_completion(&self, completion_event_id: u64) -> bool {
        self.history.iter().all(|e| match e {
            Event::ActivityCompleted {
                event_id,
                source_event_id,
                ..
            }
            | Event::ActivityFailed {
                event_id,
                source_event_id,
                ..
            }
            | Event::TimerFired {
                event_id,
                source_event_id,
                ..
            } => {
                self.cancelled_source_ids.contains(source_event_id)
                    || *event_id >= completion_event_id
                    || self.consumed_completions.contains(event_id)
            }
            // External events are not cancellable through select.
            Event::ExternalEvent { event_id, .. } => {
                *event_id >= completion_event_id || self.consumed_completions.contains(event_id)
            }
            _ => true,
        })
    }

    /// Descriptions of scheduling events no primitive call claimed this pass.
    /// Non-empty at orchestrator completion means the code diverged from the
    /// history (for instance a call site was removed).
    fn unclaimed_scheduling_events(&self) -> Vec<String> {
        self.history
            .iter()
            .filter_map(|e| match e {
                Event::ActivityScheduled { event_id, name, .. }
                    if !self.claimed_scheduling_events.contains(event_id) =>
                {
                    Some(format!("activity '{name}' (id {event_id})"))
                }
                Event::TimerCreated { event_id, .. }
                    if !self.claimed_scheduling_events.contains(event_id) =>
                {
                    Some(format!("timer (id {event_id})"))
                }
                Event::ExternalSubscribed { event_id, name }
                    if !self.claimed_scheduling_events.contains(event_id) =>
                {
                    Some(format!("external subscription '{name}' (id {event_id})"))
                }
                _ => None,
            })
            .collect()
    }
}

/// Replay-aware handle to an orchestration instance, passed to orchestrator
/// code. Cloning is cheap; all clones share the turn's state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: String, execution_id: u64, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id, execution_id, history))),
        }
    }

    pub fn instance_id(&self) -> String {
        self.inner.lock().unwrap().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.inner.lock().unwrap().execution_id
    }

    /// Schedule an activity invocation (fan-out primitive). The returned
    /// future resolves to the activity's result once its completion event is
    /// in history.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> TaskFuture {
        TaskFuture(FutureKind::Activity {
            name: name.into(),
            input: input.into(),
            claimed: std::cell::Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Schedule a durable timer. Fires no earlier than `delay` after the
    /// orchestration's logical now.
    pub fn schedule_timer(&self, delay: Duration) -> TaskFuture {
        TaskFuture(FutureKind::Timer {
            delay_ms: delay.as_millis() as u64,
            claimed: std::cell::Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Subscribe to a named external event raised through the client.
    pub fn schedule_wait(&self, name: impl Into<String>) -> TaskFuture {
        TaskFuture(FutureKind::External {
            name: name.into(),
            claimed: std::cell::Cell::new(None),
            cached: std::cell::RefCell::new(None),
            ctx: self.clone(),
        })
    }

    /// Schedule an activity under a retry policy. Each backoff delay is a
    /// durable timer, so the attempt sequence replays deterministically.
    /// Exhausting the policy yields a terminal error naming the activity,
    /// the attempt count, and the last failure.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> impl Future<Output = Result<String, String>> {
        let ctx = self.clone();
        let name = name.into();
        let input = input.into();
        async move {
            let mut attempt: u32 = 1;
            loop {
                let outcome = match policy.timeout {
                    Some(timeout) => {
                        let activity = ctx.schedule_activity(&name, &input);
                        let deadline = ctx.schedule_timer(timeout);
                        let (winner, output) = ctx.select2(activity, deadline).await;
                        match (winner, output) {
                            (0, TaskOutput::Activity(result)) => result,
                            _ => Err(format!(
                                "activity '{name}' timed out after {}ms",
                                timeout.as_millis()
                            )),
                        }
                    }
                    None => ctx.schedule_activity(&name, &input).into_activity().await,
                };
                match outcome {
                    Ok(value) => return Ok(value),
                    Err(error) => {
                        if attempt >= policy.max_attempts {
                            return Err(format!(
                                "activity '{name}' exhausted {} attempts: {error}",
                                policy.max_attempts
                            ));
                        }
                        let delay = policy.delay_for_attempt(attempt);
                        if !delay.is_zero() {
                            ctx.schedule_timer(delay).into_timer().await;
                        }
                        attempt += 1;
                    }
                }
            }
        }
    }

    /// ALL-mode fan-in barrier: resolves once every child has a terminal
    /// completion, yielding outputs in submission order regardless of
    /// completion order.
    pub fn join(&self, children: Vec<TaskFuture>) -> JoinFuture {
        JoinFuture::new(children)
    }

    /// ANY-mode race: resolves with `(winner_index, output)` for the first
    /// completion in history order. Losers are not cancelled; their late
    /// results are discarded when they arrive.
    pub fn select(&self, children: Vec<TaskFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), children)
    }

    pub fn join2(
        &self,
        a: TaskFuture,
        b: TaskFuture,
    ) -> impl Future<Output = (TaskOutput, TaskOutput)> {
        let join = self.join(vec![a, b]);
        async move {
            let mut outputs = join.await;
            let second = outputs.pop().expect("join2 yields two outputs");
            let first = outputs.pop().expect("join2 yields two outputs");
            (first, second)
        }
    }

    pub fn select2(&self, a: TaskFuture, b: TaskFuture) -> SelectFuture {
        self.select(vec![a, b])
    }

    /// Await all children and aggregate: `Ok` carries every result in
    /// submission order; if any child failed the whole wait fails with an
    /// error enumerating each failed member.
    pub fn wait_all(
        &self,
        children: Vec<TaskFuture>,
    ) -> impl Future<Output = Result<Vec<String>, String>> {
        let descriptions: Vec<String> = children.iter().map(TaskFuture::describe).collect();
        let join = self.join(children);
        async move {
            let outputs = join.await;
            let total = outputs.len();
            let mut results = Vec::with_capacity(total);
            let mut failures: Vec<String> = Vec::new();
            for (index, output) in outputs.into_iter().enumerate() {
                match output {
                    TaskOutput::Activity(Ok(value)) => results.push(value),
                    TaskOutput::Activity(Err(error)) => {
                        failures.push(format!("[{index}] {}: {error}", descriptions[index]));
                    }
                    TaskOutput::Timer => results.push(String::new()),
                    TaskOutput::External(data) => results.push(data),
                }
            }
            if failures.is_empty() {
                Ok(results)
            } else {
                Err(format!(
                    "{} of {total} parallel tasks failed: {}",
                    failures.len(),
                    failures.join("; ")
                ))
            }
        }
    }

    /// ANY-mode alias over [`select`](Self::select).
    pub fn wait_any(&self, children: Vec<TaskFuture>) -> SelectFuture {
        self.select(children)
    }

    /// Publish an orchestration-defined status payload, visible through
    /// `Client::get_custom_status`. Recorded in history so replays do not
    /// re-publish.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let status = status.into();
        let mut inner = self.inner.lock().unwrap();
        let found = inner.history.iter().find_map(|e| match e {
            Event::CustomStatusSet {
                event_id,
                status: recorded,
            } if !inner.claimed_scheduling_events.contains(event_id) => {
                Some((*event_id, recorded.clone()))
            }
            _ => None,
        });
        match found {
            Some((event_id, recorded)) => {
                if recorded == status {
                    inner.claimed_scheduling_events.insert(event_id);
                    inner.custom_status = Some(status);
                } else {
                    inner.nondeterminism_error = Some(format!(
                        "custom status mismatch: history recorded '{recorded}' but orchestrator set '{status}'"
                    ));
                }
            }
            None => {
                let event_id = inner.allocate_event_id();
                inner.history.push(Event::CustomStatusSet {
                    event_id,
                    status: status.clone(),
                });
                inner.claimed_scheduling_events.insert(event_id);
                inner.custom_status = Some(status);
            }
        }
    }

    /// Restart this instance as a fresh execution carrying `input`, archiving
    /// the current history. The returned future never resolves; the turn ends
    /// here and the new execution starts from its own `OrchestrationStarted`.
    pub fn continue_as_new(&self, input: impl Into<String>) -> impl Future<Output = ()> {
        self.inner
            .lock()
            .unwrap()
            .record_action(Action::ContinueAsNew {
                input: input.into(),
            });
        std::future::pending()
    }

    /// Deterministic guid: generated once, recorded, replayed verbatim.
    pub fn new_guid(&self) -> String {
        self.system_call(SYSCALL_OP_GUID.to_string(), |_| generate_guid())
    }

    /// Wall-clock milliseconds, captured once and replayed verbatim.
    pub fn system_now_ms(&self) -> u64 {
        self.system_call(SYSCALL_OP_UTCNOW_MS.to_string(), |_| {
            wall_clock_ms().to_string()
        })
        .parse()
        .unwrap_or(0)
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message.into());
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }

    /// Replay-safe log emission: the line is written to `tracing` only on the
    /// pass that first records it, never again on replay.
    fn trace(&self, level: &str, message: String) {
        let op = format!("{SYSCALL_OP_TRACE_PREFIX}{level}:{message}");
        self.system_call(op, |inner| {
            match level {
                "ERROR" => tracing::error!(
                    target: "durafan::orchestration",
                    instance_id = %inner.instance_id,
                    execution_id = inner.execution_id,
                    "{message}"
                ),
                "WARN" => tracing::warn!(
                    target: "durafan::orchestration",
                    instance_id = %inner.instance_id,
                    execution_id = inner.execution_id,
                    "{message}"
                ),
                "DEBUG" => tracing::debug!(
                    target: "durafan::orchestration",
                    instance_id = %inner.instance_id,
                    execution_id = inner.execution_id,
                    "{message}"
                ),
                _ => tracing::info!(
                    target: "durafan::orchestration",
                    instance_id = %inner.instance_id,
                    execution_id = inner.execution_id,
                    "{message}"
                ),
            }
            String::new()
        });
    }

    /// Adopt the first matching unconsumed `SystemCall` from history, or
    /// compute the value once and record it.
    fn system_call(&self, op: String, compute: impl FnOnce(&CtxInner) -> String) -> String {
        let mut inner = self.inner.lock().unwrap();
        let found = inner.history.iter().find_map(|e| match e {
            Event::SystemCall {
                event_id,
                op: recorded_op,
                value,
            } if *recorded_op == op && !inner.claimed_scheduling_events.contains(event_id) => {
                Some((*event_id, value.clone()))
            }
            _ => None,
        });
        if let Some((event_id, value)) = found {
            inner.claimed_scheduling_events.insert(event_id);
            return value;
        }
        let value = compute(&inner);
        let event_id = inner.allocate_event_id();
        inner.history.push(Event::SystemCall {
            event_id,
            op,
            value: value.clone(),
        });
        inner.claimed_scheduling_events.insert(event_id);
        value
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    pub(crate) fn turn_delta(&self) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        inner.history[inner.baseline_len..].to_vec()
    }

    pub(crate) fn nondeterminism(&self) -> Option<String> {
        self.inner.lock().unwrap().nondeterminism_error.clone()
    }

    /// Changes monotonically within one replay pass; used by the turn driver
    /// to detect a fixed point.
    pub(crate) fn progress_marker(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        (
            inner.claimed_scheduling_events.len(),
            inner.consumed_completions.len(),
            inner.history.len(),
        )
    }

    /// Latest custom status as of this pass (recorded or replayed).
    pub fn custom_status(&self) -> Option<String> {
        self.inner.lock().unwrap().custom_status.clone()
    }

    pub(crate) fn unclaimed_scheduling_events(&self) -> Vec<String> {
        self.inner.lock().unwrap().unclaimed_scheduling_events()
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Guid from timestamp plus a process-local counter; only ever called on the
/// recording pass, so replay sees the captured value.
fn generate_guid() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    thread_local! {
        static COUNTER: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
    }
    let counter = COUNTER.with(|c| {
        let val = c.get();
        c.set(val.wrapping_add(1));
        val
    });
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (timestamp >> 96) as u32,
        ((timestamp >> 80) & 0xFFFF) as u16,
        (counter & 0xFFFF) as u16,
        ((timestamp >> 64) & 0xFFFF) as u16,
        (timestamp & 0xFFFF_FFFF_FFFF) as u64
    )
}

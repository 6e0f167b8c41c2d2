//! In-process runtime: the orchestration coordinator plus worker and timer
//! dispatchers, all persisting through a [`Provider`].
//!
//! Each orchestration instance executes as a single-threaded, cooperatively
//! suspended logical task: the coordinator leases one instance at a time,
//! folds its newly arrived completion messages into history, re-runs the
//! orchestrator against that history, and commits the resulting delta and
//! follow-up work in one atomic ack. Different instances run in parallel;
//! activities run on the worker dispatcher with no ordering guarantee.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{InMemoryProvider, OrchestrationItem, Provider, WorkItem};
use crate::{wall_clock_ms, Action, Event, OrchestrationContext, INITIAL_EVENT_ID};

pub mod registry;
mod replay;
pub mod status;

pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use status::{status_from_history, OrchestrationStatus, WaitError};

use replay::run_turn;
use status::HistorySnapshot;

/// Configuration options for the [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Fallback poll interval when a dispatcher queue is idle. Providers
    /// with wake support return earlier; this only bounds worst-case
    /// latency.
    pub dispatcher_idle_sleep_ms: u64,
    /// Lease duration a coordinator holds on an instance per turn. Expiry
    /// allows takeover after a crash; a stale holder is fenced at commit.
    pub lock_lease_ms: u64,
    /// Bounded retries for a retryable commit failure before the turn is
    /// abandoned and redelivered.
    pub max_commit_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 100,
            lock_lease_ms: 30_000,
            max_commit_attempts: 5,
        }
    }
}

/// Trait implemented by orchestration handlers invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers executed on the worker pool.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

pub fn kind_of(msg: &WorkItem) -> &'static str {
    match msg {
        WorkItem::StartOrchestration { .. } => "StartOrchestration",
        WorkItem::ActivityExecute { .. } => "ActivityExecute",
        WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
        WorkItem::ActivityFailed { .. } => "ActivityFailed",
        WorkItem::TimerSchedule { .. } => "TimerSchedule",
        WorkItem::TimerFired { .. } => "TimerFired",
        WorkItem::ExternalRaised { .. } => "ExternalRaised",
        WorkItem::CancelInstance { .. } => "CancelInstance",
        WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
    }
}

/// In-process runtime executing orchestrations and activities against a
/// shared provider.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    provider: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime backed by the in-memory provider.
    pub async fn start(
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        Self::start_with_store(provider, activities, orchestrations).await
    }

    /// Start a runtime with a custom [`Provider`] implementation.
    pub async fn start_with_store(
        provider: Arc<dyn Provider>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(provider, activities, orchestrations, RuntimeOptions::default())
            .await
    }

    /// Start a runtime with custom options.
    pub async fn start_with_options(
        provider: Arc<dyn Provider>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            provider,
            orchestrations,
            options,
        });

        let orchestration_handle = runtime.clone().start_orchestration_dispatcher();
        let worker_handle = runtime.clone().start_worker_dispatcher(activities);
        let timer_handle = runtime.clone().start_timer_dispatcher();
        let mut joins = runtime.joins.lock().await;
        joins.push(orchestration_handle);
        joins.push(worker_handle);
        joins.push(timer_handle);
        drop(joins);

        runtime
    }

    /// Abort background dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            handle.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let lease = Duration::from_millis(self.options.lock_lease_ms);
            let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
            loop {
                if let Some(item) = self.provider.fetch_orchestration_item(lease).await {
                    self.process_orchestration_item(item).await;
                } else {
                    self.provider.wait_for_orchestrator_work(idle).await;
                }
            }
        })
    }

    /// Run one atomic coordinator turn for a leased instance.
    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token,
        } = item;

        // Partition the batch by message role.
        let mut start_msg: Option<(String, String)> = None;
        let mut continue_msg: Option<(String, String)> = None;
        let mut cancel_msg: Option<String> = None;
        let mut completions: Vec<WorkItem> = Vec::new();
        for msg in messages {
            match msg {
                WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    ..
                } => {
                    if start_msg.is_none() {
                        start_msg = Some((orchestration, input));
                    } else {
                        warn!(instance = %instance, "duplicate start message ignored");
                    }
                }
                WorkItem::ContinueAsNew {
                    orchestration,
                    input,
                    ..
                } => continue_msg = Some((orchestration, input)),
                WorkItem::CancelInstance { reason, .. } => cancel_msg = Some(reason),
                other @ (WorkItem::ActivityCompleted { .. }
                | WorkItem::ActivityFailed { .. }
                | WorkItem::TimerFired { .. }
                | WorkItem::ExternalRaised { .. }) => completions.push(other),
                other => {
                    error!(instance = %instance, kind = kind_of(&other), "unexpected message on orchestrator queue; dropped");
                }
            }
        }

        // Terminal instances discard late arrivals; in-flight work is never
        // awaited or killed, its results simply have nowhere to land.
        let snapshot = HistorySnapshot::from_history(&history);
        let terminal = snapshot.is_completed || snapshot.is_failed || snapshot.is_cancelled;
        if terminal || (snapshot.is_continued_as_new && continue_msg.is_none()) {
            warn!(
                instance = %instance,
                discarded = completions.len(),
                "instance is terminal; acking batch without processing"
            );
            self.commit_turn(&lock_token, execution_id, Vec::new(), Vec::new(), Vec::new(), Vec::new())
                .await;
            return;
        }

        // Decide the execution and base history for this turn.
        let (exec_id, base_history, orchestration_name, orchestration_input) =
            if let Some((orchestration, input)) = continue_msg {
                (execution_id + 1, Vec::new(), orchestration, input)
            } else if history.is_empty() {
                match start_msg {
                    Some((orchestration, input)) => (execution_id, Vec::new(), orchestration, input),
                    None => {
                        warn!(instance = %instance, "batch for unknown instance without start message; dropped");
                        self.commit_turn(
                            &lock_token,
                            execution_id,
                            Vec::new(),
                            Vec::new(),
                            Vec::new(),
                            Vec::new(),
                        )
                        .await;
                        return;
                    }
                }
            } else {
                if start_msg.is_some() {
                    warn!(instance = %instance, "start message for existing instance ignored");
                }
                (
                    execution_id,
                    history,
                    snapshot.orchestration_name.clone().unwrap_or_default(),
                    snapshot.orchestration_input.clone().unwrap_or_default(),
                )
            };

        let mut full = base_history;
        let mut delta: Vec<Event> = Vec::new();
        let mut next_event_id = full
            .iter()
            .map(Event::event_id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(INITIAL_EVENT_ID);

        let handler = self.orchestrations.get(&orchestration_name);

        if full.is_empty() {
            let started = Event::OrchestrationStarted {
                event_id: next_event_id,
                name: orchestration_name.clone(),
                input: orchestration_input.clone(),
                started_at_ms: wall_clock_ms(),
            };
            next_event_id += 1;
            full.push(started.clone());
            delta.push(started);
            debug!(
                instance = %instance,
                orchestration = %orchestration_name,
                execution_id = exec_id,
                "starting execution"
            );
        }

        if handler.is_none() {
            warn!(instance = %instance, orchestration = %orchestration_name, "unregistered orchestration");
            delta.push(Event::OrchestrationFailed {
                event_id: next_event_id,
                error: format!("unregistered orchestration: {orchestration_name}"),
            });
            self.commit_turn(&lock_token, exec_id, delta, Vec::new(), Vec::new(), Vec::new())
                .await;
            return;
        }

        // Cancellation preempts execution; the marker is the last word.
        if let Some(reason) = cancel_msg {
            debug!(instance = %instance, reason = %reason, "cancelling instance");
            delta.push(Event::OrchestrationCancelled {
                event_id: next_event_id,
                reason,
            });
            self.commit_turn(&lock_token, exec_id, delta, Vec::new(), Vec::new(), Vec::new())
                .await;
            return;
        }

        // Fold completion messages into history events before replay.
        for msg in completions {
            fold_completion_message(&instance, exec_id, &mut full, &mut delta, &mut next_event_id, msg);
        }

        let turn = run_turn(
            &instance,
            exec_id,
            full,
            handler.expect("checked above"),
            orchestration_input,
        );

        if let Some(max_id) = turn.history_delta.iter().map(Event::event_id).max() {
            next_event_id = next_event_id.max(max_id + 1);
        }
        delta.extend(turn.history_delta);

        if let Some(reason) = turn.nondeterminism {
            error!(instance = %instance, error = %reason, "replay mismatch; failing instance");
            delta.push(Event::OrchestrationFailed {
                event_id: next_event_id,
                error: format!("nondeterministic execution detected: {reason}"),
            });
            self.commit_turn(&lock_token, exec_id, delta, Vec::new(), Vec::new(), Vec::new())
                .await;
            return;
        }

        let mut worker_items: Vec<WorkItem> = Vec::new();
        let mut timer_items: Vec<WorkItem> = Vec::new();
        let mut orchestrator_items: Vec<WorkItem> = Vec::new();
        for action in turn.actions {
            match action {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                } => worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.clone(),
                    execution_id: exec_id,
                    id: scheduling_event_id,
                    name,
                    input,
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => timer_items.push(WorkItem::TimerSchedule {
                    instance: instance.clone(),
                    execution_id: exec_id,
                    id: scheduling_event_id,
                    fire_at_ms,
                }),
                // Subscriptions live in history only; delivery matches by name.
                Action::WaitExternal { .. } => {}
                Action::ContinueAsNew { input } => {
                    delta.push(Event::OrchestrationContinuedAsNew {
                        event_id: next_event_id,
                        input: input.clone(),
                    });
                    next_event_id += 1;
                    orchestrator_items.push(WorkItem::ContinueAsNew {
                        instance: instance.clone(),
                        orchestration: orchestration_name.clone(),
                        input,
                    });
                }
            }
        }

        // A continue-as-new decision ends the turn; a simultaneously returned
        // value belongs to the execution that no longer runs.
        let continued = !orchestrator_items.is_empty();
        if let Some(output) = turn.output.filter(|_| !continued) {
            match output {
                Ok(output) => {
                    debug!(instance = %instance, "orchestration completed");
                    delta.push(Event::OrchestrationCompleted {
                        event_id: next_event_id,
                        output,
                    });
                }
                Err(error) => {
                    debug!(instance = %instance, error = %error, "orchestration failed");
                    delta.push(Event::OrchestrationFailed {
                        event_id: next_event_id,
                        error,
                    });
                }
            }
        }

        debug!(
            instance = %instance,
            history_delta = delta.len(),
            worker = worker_items.len(),
            timer = timer_items.len(),
            orchestrator = orchestrator_items.len(),
            "committing turn"
        );
        self.commit_turn(
            &lock_token,
            exec_id,
            delta,
            worker_items,
            timer_items,
            orchestrator_items,
        )
        .await;
    }

    /// Commit a turn with bounded retry on transient provider errors; any
    /// other failure abandons the lease so the batch is redelivered.
    async fn commit_turn(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) {
        let mut attempts: u32 = 0;
        loop {
            match self
                .provider
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    orchestrator_items.clone(),
                )
                .await
            {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempts < self.options.max_commit_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "commit failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(error = %e, "commit failed; abandoning turn for redelivery");
                    if let Err(abandon_err) = self
                        .provider
                        .abandon_orchestration_item(lock_token, Some(50))
                        .await
                    {
                        debug!(error = %abandon_err, "abandon after failed commit");
                    }
                    return;
                }
            }
        }
    }

    fn start_worker_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        // Activities run truly in parallel with no ordering guarantee among
        // each other; only the fan-in barrier re-imposes order.
        tokio::spawn(async move {
            let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
            loop {
                if let Some((item, token)) = self.provider.dequeue_worker_peek_lock().await {
                    let provider = self.provider.clone();
                    let activities = activities.clone();
                    tokio::spawn(async move {
                        execute_activity(provider, activities, item, token).await;
                    });
                } else {
                    self.provider.wait_for_worker_work(idle).await;
                }
            }
        })
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
            loop {
                if let Some((item, token)) = self.provider.dequeue_timer_peek_lock().await {
                    match item {
                        WorkItem::TimerSchedule {
                            instance,
                            execution_id,
                            id,
                            fire_at_ms,
                        } => {
                            let delay_ms = fire_at_ms.saturating_sub(wall_clock_ms());
                            let fired = WorkItem::TimerFired {
                                instance,
                                execution_id,
                                id,
                                fire_at_ms,
                            };
                            if self
                                .provider
                                .enqueue_orchestrator_work(fired, Some(delay_ms))
                                .await
                                .is_ok()
                            {
                                let _ = self.provider.ack_timer(&token).await;
                            }
                        }
                        other => {
                            error!(kind = kind_of(&other), "unexpected item on timer queue; dropped");
                            let _ = self.provider.ack_timer(&token).await;
                        }
                    }
                } else {
                    self.provider.wait_for_timer_work(idle).await;
                }
            }
        })
    }
}

/// Execute one activity work item and report its completion. The worker item
/// is acked only after the completion enqueue succeeds; a crash in between
/// redelivers the activity instead of losing its result.
async fn execute_activity(
    provider: Arc<dyn Provider>,
    activities: Arc<ActivityRegistry>,
    item: WorkItem,
    token: String,
) {
    let (instance, execution_id, id, name, input) = match item {
        WorkItem::ActivityExecute {
            instance,
            execution_id,
            id,
            name,
            input,
        } => (instance, execution_id, id, name, input),
        other => {
            error!(kind = kind_of(&other), "unexpected item on worker queue; dropped");
            let _ = provider.ack_worker(&token).await;
            return;
        }
    };

    let outcome = match activities.get(&name) {
        Some(handler) => handler.invoke(input).await,
        None => {
            warn!(instance = %instance, activity = %name, "unregistered activity");
            Err(format!("unregistered:{name}"))
        }
    };

    let completion = match outcome {
        Ok(result) => WorkItem::ActivityCompleted {
            instance: instance.clone(),
            execution_id,
            id,
            result,
        },
        Err(error) => WorkItem::ActivityFailed {
            instance: instance.clone(),
            execution_id,
            id,
            error,
        },
    };

    if provider.enqueue_orchestrator_work(completion, None).await.is_ok() {
        let _ = provider.ack_worker(&token).await;
    } else {
        warn!(instance = %instance, execution_id, id, "completion enqueue failed; worker item not acked");
    }
}

/// Turn a completion message into its history event, validating correlation
/// and dropping stale or duplicate deliveries.
fn fold_completion_message(
    instance: &str,
    exec_id: u64,
    full: &mut Vec<Event>,
    delta: &mut Vec<Event>,
    next_event_id: &mut u64,
    msg: WorkItem,
) {
    let event = match msg {
        WorkItem::ActivityCompleted {
            execution_id,
            id,
            result,
            ..
        } => {
            if execution_id != exec_id {
                warn!(instance, id, execution_id, "stale activity completion dropped");
                return;
            }
            if !has_scheduling_event(full, id, SchedulingClass::Activity) {
                warn!(instance, id, "activity completion without scheduling event dropped");
                return;
            }
            if has_completion(full, id) {
                warn!(instance, id, "duplicate activity completion dropped");
                return;
            }
            Event::ActivityCompleted {
                event_id: *next_event_id,
                source_event_id: id,
                result,
            }
        }
        WorkItem::ActivityFailed {
            execution_id,
            id,
            error,
            ..
        } => {
            if execution_id != exec_id {
                warn!(instance, id, execution_id, "stale activity failure dropped");
                return;
            }
            if !has_scheduling_event(full, id, SchedulingClass::Activity) {
                warn!(instance, id, "activity failure without scheduling event dropped");
                return;
            }
            if has_completion(full, id) {
                warn!(instance, id, "duplicate activity failure dropped");
                return;
            }
            Event::ActivityFailed {
                event_id: *next_event_id,
                source_event_id: id,
                error,
            }
        }
        WorkItem::TimerFired {
            execution_id,
            id,
            fire_at_ms,
            ..
        } => {
            if execution_id != exec_id {
                warn!(instance, id, execution_id, "stale timer firing dropped");
                return;
            }
            if !has_scheduling_event(full, id, SchedulingClass::Timer) {
                warn!(instance, id, "timer firing without scheduling event dropped");
                return;
            }
            if has_completion(full, id) {
                warn!(instance, id, "duplicate timer firing dropped");
                return;
            }
            Event::TimerFired {
                event_id: *next_event_id,
                source_event_id: id,
                fire_at_ms,
            }
        }
        WorkItem::ExternalRaised { name, data, .. } => {
            let subscribed = full
                .iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if *n == name));
            if !subscribed {
                warn!(instance, event = %name, "external event without subscription dropped");
                return;
            }
            Event::ExternalEvent {
                event_id: *next_event_id,
                name,
                data,
            }
        }
        other => {
            error!(instance, kind = kind_of(&other), "unexpected completion message");
            return;
        }
    };
    *next_event_id += 1;
    full.push(event.clone());
    delta.push(event);
}

enum SchedulingClass {
    Activity,
    Timer,
}

fn has_scheduling_event(history: &[Event], id: u64, class: SchedulingClass) -> bool {
    history.iter().any(|e| match (e, &class) {
        (Event::ActivityScheduled { event_id, .. }, SchedulingClass::Activity) => *event_id == id,
        (Event::TimerCreated { event_id, .. }, SchedulingClass::Timer) => *event_id == id,
        _ => false,
    })
}

fn has_completion(history: &[Event], source_event_id: u64) -> bool {
    history
        .iter()
        .any(|e| e.completion_source() == Some(source_event_id))
}

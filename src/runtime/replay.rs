//! One deterministic replay pass of an orchestrator function.
//!
//! The orchestrator future is re-created from scratch and polled with a noop
//! waker: our futures resolve from history alone, so a single poll runs the
//! function forward through every await whose completion is already recorded
//! and stops at the first one that is not. Whatever the pass scheduled for
//! the first time comes back as the turn's history delta and actions.

use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use super::OrchestrationHandler;
use crate::{Action, Event, OrchestrationContext};

/// Outcome of a single replay pass.
pub(crate) struct TurnResult {
    /// Events the pass appended (scheduling decisions, system calls, custom
    /// status), in order.
    pub history_delta: Vec<Event>,
    /// Outbound work for the genuinely new decisions.
    pub actions: Vec<Action>,
    /// Set when the orchestrator function returned.
    pub output: Option<Result<String, String>>,
    /// Set when replay diverged from history; fatal for the instance.
    pub nondeterminism: Option<String>,
}

pub(crate) fn run_turn(
    instance: &str,
    execution_id: u64,
    history: Vec<Event>,
    handler: Arc<dyn OrchestrationHandler>,
    input: String,
) -> TurnResult {
    let ctx = OrchestrationContext::new(instance.to_string(), execution_id, history);

    let mut fut = handler.invoke(ctx.clone(), input);
    let waker = noop_waker();
    let mut poll_cx = Context::from_waker(&waker);
    // Poll to a fixed point: a pass that claimed or consumed anything may have
    // unblocked a sibling future behind the completion FIFO gate (combinators
    // poll each child once per pass).
    let mut last_marker = ctx.progress_marker();
    let output = loop {
        match fut.as_mut().poll(&mut poll_cx) {
            Poll::Ready(output) => break Some(output),
            Poll::Pending => {
                let marker = ctx.progress_marker();
                if marker == last_marker {
                    break None;
                }
                last_marker = marker;
            }
        }
    };
    drop(fut);

    let mut nondeterminism = ctx.nondeterminism();
    if nondeterminism.is_none() {
        if let Some(Ok(_)) = &output {
            // A completing orchestrator must have re-issued every scheduling
            // call history recorded; leftovers mean the code changed.
            let unclaimed = ctx.unclaimed_scheduling_events();
            if !unclaimed.is_empty() {
                nondeterminism = Some(format!(
                    "orchestrator completed without re-issuing recorded scheduling calls: {}",
                    unclaimed.join(", ")
                ));
            }
        }
    }

    TurnResult {
        history_delta: ctx.turn_delta(),
        actions: ctx.take_actions(),
        output,
        nondeterminism,
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

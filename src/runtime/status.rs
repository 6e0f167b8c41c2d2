//! Orchestration status, derived purely from history.

use crate::Event;

/// High-level instance status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Cancelled { reason: String },
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Cancelled { .. }
        )
    }
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Metadata extracted from one execution's history in a single scan.
#[derive(Debug, Clone, Default)]
pub(crate) struct HistorySnapshot {
    pub orchestration_name: Option<String>,
    pub orchestration_input: Option<String>,
    pub is_completed: bool,
    pub is_failed: bool,
    pub is_cancelled: bool,
    pub is_continued_as_new: bool,
    /// Output, error, or cancellation reason of the terminal event.
    pub terminal_payload: Option<String>,
    pub custom_status: Option<String>,
}

impl HistorySnapshot {
    pub fn from_history(history: &[Event]) -> Self {
        let mut snapshot = Self::default();
        for event in history {
            match event {
                Event::OrchestrationStarted { name, input, .. } => {
                    snapshot.orchestration_name = Some(name.clone());
                    snapshot.orchestration_input = Some(input.clone());
                }
                Event::CustomStatusSet { status, .. } => {
                    snapshot.custom_status = Some(status.clone());
                }
                Event::OrchestrationCompleted { output, .. } => {
                    snapshot.is_completed = true;
                    snapshot.terminal_payload = Some(output.clone());
                }
                Event::OrchestrationFailed { error, .. } => {
                    snapshot.is_failed = true;
                    snapshot.terminal_payload = Some(error.clone());
                }
                Event::OrchestrationCancelled { reason, .. } => {
                    snapshot.is_cancelled = true;
                    snapshot.terminal_payload = Some(reason.clone());
                }
                Event::OrchestrationContinuedAsNew { .. } => {
                    snapshot.is_continued_as_new = true;
                }
                _ => {}
            }
        }
        snapshot
    }
}

/// Derive the status of an execution from its history.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    let snapshot = HistorySnapshot::from_history(history);
    if snapshot.is_completed {
        OrchestrationStatus::Completed {
            output: snapshot.terminal_payload.unwrap_or_default(),
        }
    } else if snapshot.is_failed {
        OrchestrationStatus::Failed {
            error: snapshot.terminal_payload.unwrap_or_default(),
        }
    } else if snapshot.is_cancelled {
        OrchestrationStatus::Cancelled {
            reason: snapshot.terminal_payload.unwrap_or_default(),
        }
    } else if snapshot.is_continued_as_new {
        OrchestrationStatus::ContinuedAsNew
    } else {
        OrchestrationStatus::Running
    }
}

//! Workflow state machine.
//!
//! [`transition`] is the whole table; the engine never assigns a state any
//! other way. Pairs not listed in the table are rejected with a
//! [`TransitionError`] and leave the state untouched.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::core::aggregate::PhaseReport;

/// Reason recorded when a run is cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    NotStarted,
    RunningPhase { phase: String },
    AwaitingApproval { phase: String, report: PhaseReport },
    Executing { phase: String },
    Completed,
    Aborted { reason: String },
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::NotStarted => "not_started",
            WorkflowState::RunningPhase { .. } => "running_phase",
            WorkflowState::AwaitingApproval { .. } => "awaiting_approval",
            WorkflowState::Executing { .. } => "executing",
            WorkflowState::Completed => "completed",
            WorkflowState::Aborted { .. } => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Aborted { .. }
        )
    }

    pub fn phase(&self) -> Option<&str> {
        match self {
            WorkflowState::RunningPhase { phase }
            | WorkflowState::AwaitingApproval { phase, .. }
            | WorkflowState::Executing { phase } => Some(phase),
            _ => None,
        }
    }
}

/// Host answer to an approval gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve,
    Reject,
    /// Approve with changes merged into the execution requests.
    Modify(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    /// The current phase finished without aborting the run.
    PhaseSucceeded { report: PhaseReport, gated: bool },
    Decide(Decision),
    ExecutionCompleted,
    Fail(String),
    Cancel,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::PhaseSucceeded { .. } => "phase_succeeded",
            Event::Decide(Decision::Approve) => "approve",
            Event::Decide(Decision::Reject) => "reject",
            Event::Decide(Decision::Modify(_)) => "modify",
            Event::ExecutionCompleted => "execution_completed",
            Event::Fail(_) => "fail",
            Event::Cancel => "cancel",
        }
    }
}

/// An event that is not valid in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub state: &'static str,
    pub event: &'static str,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while {}", self.event, self.state)
    }
}

impl std::error::Error for TransitionError {}

/// Apply `event` to `state`. `phases` lists phase names in run order.
pub fn transition(
    state: &WorkflowState,
    event: Event,
    phases: &[String],
) -> Result<WorkflowState, TransitionError> {
    let rejected = |event: &Event| TransitionError {
        state: state.name(),
        event: event.name(),
    };
    if state.is_terminal() {
        return Err(rejected(&event));
    }

    match (state, event) {
        (_, Event::Fail(reason)) => Ok(WorkflowState::Aborted { reason }),
        (_, Event::Cancel) => Ok(WorkflowState::Aborted {
            reason: CANCELLED_REASON.to_string(),
        }),
        (WorkflowState::NotStarted, Event::Start) => Ok(match phases.first() {
            Some(first) => WorkflowState::RunningPhase {
                phase: first.clone(),
            },
            None => WorkflowState::Completed,
        }),
        (WorkflowState::RunningPhase { phase }, Event::PhaseSucceeded { report, gated }) => {
            if gated {
                Ok(WorkflowState::AwaitingApproval {
                    phase: phase.clone(),
                    report,
                })
            } else {
                Ok(after(phase, phases))
            }
        }
        (WorkflowState::AwaitingApproval { phase, .. }, Event::Decide(decision)) => {
            Ok(match decision {
                Decision::Approve | Decision::Modify(_) => WorkflowState::Executing {
                    phase: phase.clone(),
                },
                Decision::Reject => WorkflowState::Aborted {
                    reason: format!("rejected at {phase}"),
                },
            })
        }
        (WorkflowState::Executing { phase }, Event::ExecutionCompleted) => Ok(after(phase, phases)),
        (_, event) => Err(rejected(&event)),
    }
}

fn after(phase: &str, phases: &[String]) -> WorkflowState {
    phases
        .iter()
        .position(|name| name == phase)
        .and_then(|idx| phases.get(idx + 1))
        .map_or(WorkflowState::Completed, |next| WorkflowState::RunningPhase {
            phase: next.clone(),
        })
}

//! Approval-gated multi-phase workflows.
//!
//! A [`WorkflowEngine`] owns one run. It evaluates each phase's schedule,
//! aggregates the outcome and either advances, pauses at an approval gate, or
//! aborts. While paused the engine does nothing until the host calls
//! [`WorkflowEngine::decide`] (or one of its shorthands).
//!
//! State changes only go through [`core::state::transition`]; every method
//! that changes state takes `&mut self`, so phase advancement is serialized
//! by ownership. [`CancelHandle`] is the one way to reach a running engine
//! from another task.
//!
//! [`core::state::transition`]: crate::core::state::transition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::aggregate::{PhaseReport, aggregate};
use crate::core::outcome::{FailurePolicy, PhaseResult, PhaseStatus};
use crate::core::state::{Decision, Event, TransitionError, WorkflowState, transition};
use crate::invoke::InvocationRequest;
use crate::schedule::{ScheduleNode, Scheduler};

/// Payload key that carries approval modifications into execute requests.
pub const MODIFICATIONS_KEY: &str = "modifications";

/// What a failed phase does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Abort,
    /// Record the failure and move on.
    Continue,
}

/// Pause after a phase until the host decides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApprovalGate {
    /// Run after approval; `None` means approval only advances.
    pub execute: Option<ScheduleNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub name: String,
    pub schedule: ScheduleNode,
    pub policy: FailurePolicy,
    pub gate: Option<ApprovalGate>,
    pub on_failure: OnFailure,
}

impl Phase {
    pub fn new(name: impl Into<String>, schedule: ScheduleNode) -> Self {
        Self {
            name: name.into(),
            schedule,
            policy: FailurePolicy::default(),
            gate: None,
            on_failure: OnFailure::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_gate(mut self, gate: ApprovalGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub phases: Vec<Phase>,
}

/// Which schedule of a phase produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Execution,
}

/// One evaluated schedule, kept for the whole run (also after an abort).
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRecord {
    pub phase: String,
    pub stage: Stage,
    pub result: PhaseResult,
    pub report: PhaseReport,
}

/// Cancels an engine from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Host side of approval gates.
#[async_trait]
pub trait ApprovalHost: Send + Sync {
    fn present_report(&self, phase: &str, report: &PhaseReport);

    /// Resolves when the human has decided. The engine waits indefinitely.
    async fn await_decision(&self, phase: &str) -> Decision;
}

pub struct WorkflowEngine {
    definition: WorkflowDefinition,
    phase_names: Vec<String>,
    scheduler: Scheduler,
    state: WorkflowState,
    records: Vec<PhaseRecord>,
    cancel: CancellationToken,
    modifications: Option<Value>,
}

impl WorkflowEngine {
    pub fn new(definition: WorkflowDefinition, scheduler: Scheduler) -> Self {
        let phase_names = definition.phases.iter().map(|p| p.name.clone()).collect();
        Self {
            definition,
            phase_names,
            scheduler,
            state: WorkflowState::NotStarted,
            records: Vec::new(),
            cancel: CancellationToken::new(),
            modifications: None,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Every evaluated schedule so far, in run order.
    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Begin the run and drive it until it completes, aborts or reaches a gate.
    #[instrument(skip_all, fields(workflow = %self.definition.name))]
    pub async fn start(&mut self) -> Result<&WorkflowState, TransitionError> {
        self.apply(Event::Start)?;
        self.drive().await;
        Ok(&self.state)
    }

    /// Resolve the pending approval gate and continue the run.
    ///
    /// A cancellation requested through a [`CancelHandle`] wins over the
    /// decision: the run aborts and no execute schedule starts.
    #[instrument(skip_all, fields(workflow = %self.definition.name))]
    pub async fn decide(&mut self, decision: Decision) -> Result<&WorkflowState, TransitionError> {
        if self.cancel.is_cancelled() {
            debug!("cancel requested before decision");
            self.apply(Event::Cancel)?;
            return Ok(&self.state);
        }
        let modifications = match &decision {
            Decision::Modify(details) => Some(details.clone()),
            Decision::Approve | Decision::Reject => None,
        };
        self.apply(Event::Decide(decision))?;
        self.modifications = modifications;
        self.drive().await;
        Ok(&self.state)
    }

    pub async fn approve(&mut self) -> Result<&WorkflowState, TransitionError> {
        self.decide(Decision::Approve).await
    }

    pub async fn reject(&mut self) -> Result<&WorkflowState, TransitionError> {
        self.decide(Decision::Reject).await
    }

    pub async fn modify(&mut self, details: Value) -> Result<&WorkflowState, TransitionError> {
        self.decide(Decision::Modify(details)).await
    }

    /// Abort the run. In-flight work observes the cancellation cooperatively.
    pub fn cancel(&mut self) -> Result<&WorkflowState, TransitionError> {
        self.cancel.cancel();
        self.apply(Event::Cancel)?;
        Ok(&self.state)
    }

    /// Drive the whole run, consulting `host` at every approval gate.
    pub async fn run_with_host(
        &mut self,
        host: &dyn ApprovalHost,
    ) -> Result<&WorkflowState, TransitionError> {
        if self.state == WorkflowState::NotStarted {
            self.start().await?;
        }
        loop {
            let phase = match &self.state {
                WorkflowState::AwaitingApproval { phase, report } => {
                    host.present_report(phase, report);
                    phase.clone()
                }
                _ => break,
            };
            let decision = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                decision = host.await_decision(&phase) => Some(decision),
            };
            match decision {
                Some(decision) => {
                    self.decide(decision).await?;
                }
                None => {
                    self.apply(Event::Cancel)?;
                }
            }
        }
        Ok(&self.state)
    }

    fn apply(&mut self, event: Event) -> Result<(), TransitionError> {
        let from = self.state.name();
        match transition(&self.state, event, &self.phase_names) {
            Ok(next) => {
                info!(from, to = next.name(), phase = next.phase(), "workflow transition");
                if let WorkflowState::Aborted { reason } = &next {
                    warn!(%reason, "workflow aborted");
                }
                self.state = next;
                Ok(())
            }
            Err(err) => {
                warn!(%err, "rejected workflow event");
                Err(err)
            }
        }
    }

    /// Run phases until the state is a gate or terminal.
    async fn drive(&mut self) {
        loop {
            if self.cancel.is_cancelled() && !self.state.is_terminal() {
                self.force(Event::Cancel);
                return;
            }
            let event = match self.state.clone() {
                WorkflowState::RunningPhase { phase } => self.run_analysis(&phase).await,
                WorkflowState::Executing { phase } => self.run_execution(&phase).await,
                _ => return,
            };
            self.force(event);
        }
    }

    /// Apply an event the engine generated itself; these are always valid.
    fn force(&mut self, event: Event) {
        if let Err(err) = self.apply(event) {
            self.state = WorkflowState::Aborted {
                reason: format!("internal transition error: {err}"),
            };
        }
    }

    async fn run_analysis(&mut self, name: &str) -> Event {
        let Some(phase) = self.phase(name) else {
            return Event::Fail(format!("unknown phase {name}"));
        };
        let (schedule, policy, on_failure, gated) = (
            phase.schedule.clone(),
            phase.policy,
            phase.on_failure,
            phase.gate.is_some(),
        );
        info!(phase = name, "running phase");
        match self.evaluate(name, Stage::Analysis, &schedule, policy).await {
            Ok((result, report)) => {
                if result.is_cancelled() {
                    return Event::Cancel;
                }
                if let Some(reason) = abort_reason(&result, &report, on_failure) {
                    return Event::Fail(reason);
                }
                Event::PhaseSucceeded { report, gated }
            }
            Err(reason) => Event::Fail(reason),
        }
    }

    async fn run_execution(&mut self, name: &str) -> Event {
        let Some(phase) = self.phase(name) else {
            return Event::Fail(format!("unknown phase {name}"));
        };
        let (execute, policy, on_failure) = (
            phase.gate.as_ref().and_then(|g| g.execute.clone()),
            phase.policy,
            phase.on_failure,
        );
        let modifications = self.modifications.take();
        let Some(mut execute) = execute else {
            debug!(phase = name, "gate has no execute schedule");
            return Event::ExecutionCompleted;
        };
        if let Some(details) = modifications {
            apply_modifications(&mut execute, &details);
        }
        info!(phase = name, "executing approved phase");
        match self.evaluate(name, Stage::Execution, &execute, policy).await {
            Ok((result, report)) => {
                if result.is_cancelled() {
                    return Event::Cancel;
                }
                match abort_reason(&result, &report, on_failure) {
                    Some(reason) => Event::Fail(reason),
                    None => Event::ExecutionCompleted,
                }
            }
            Err(reason) => Event::Fail(reason),
        }
    }

    async fn evaluate(
        &mut self,
        name: &str,
        stage: Stage,
        schedule: &ScheduleNode,
        policy: FailurePolicy,
    ) -> Result<(PhaseResult, PhaseReport), String> {
        let result = self
            .scheduler
            .run(schedule, policy, &self.cancel)
            .await
            .map_err(|err| format!("invalid schedule in {name}: {err:#}"))?;
        let report = aggregate(&result);
        info!(phase = name, stage = ?stage, status = %report.status, "phase finished");
        self.records.push(PhaseRecord {
            phase: name.to_string(),
            stage,
            result: result.clone(),
            report: report.clone(),
        });
        Ok((result, report))
    }

    fn phase(&self, name: &str) -> Option<&Phase> {
        self.definition.phases.iter().find(|p| p.name == name)
    }
}

fn abort_reason(result: &PhaseResult, report: &PhaseReport, on_failure: OnFailure) -> Option<String> {
    if report.status != PhaseStatus::Failed || on_failure == OnFailure::Continue {
        return None;
    }
    Some(
        result
            .failure_reason()
            .unwrap_or_else(|| "phase failed".to_string()),
    )
}

/// Merge approval details into every leaf payload under [`MODIFICATIONS_KEY`].
fn apply_modifications(schedule: &mut ScheduleNode, details: &Value) {
    schedule.for_each_request_mut(&mut |request: &mut InvocationRequest| {
        if request.payload.is_null() {
            request.payload = Value::Object(Map::new());
        }
        match request.payload.as_object_mut() {
            Some(payload) => {
                payload.insert(MODIFICATIONS_KEY.to_string(), details.clone());
            }
            None => warn!(
                worker = %request.worker_id,
                "payload is not an object; modifications not applied"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::ErrorKind;
    use crate::core::validator::EnvelopeValidator;
    use crate::invoke::{InvokerSettings, WorkerInvoker};
    use crate::test_support::{ScriptedWorker, Step, error_json, leaf, success_json};
    use serde_json::json;
    use std::sync::Arc;

    fn engine(worker: &ScriptedWorker, phases: Vec<Phase>) -> WorkflowEngine {
        let invoker = WorkerInvoker::new(
            Arc::new(worker.clone()),
            EnvelopeValidator::default(),
            InvokerSettings::default(),
        );
        WorkflowEngine::new(
            WorkflowDefinition {
                name: "test".into(),
                phases,
            },
            Scheduler::new(invoker, 4),
        )
    }

    fn gated(name: &str, analysis: &str, execute: &str) -> Phase {
        Phase::new(name, leaf(analysis)).with_gate(ApprovalGate {
            execute: Some(leaf(execute)),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn empty_workflow_completes_immediately() {
        let worker = ScriptedWorker::new();
        let mut engine = engine(&worker, Vec::new());
        assert_eq!(engine.start().await, Ok(&WorkflowState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_pauses_until_approved() {
        let worker = ScriptedWorker::new();
        worker.script("ticket", [Step::Respond(success_json("ticket"))]);
        worker.script("writer", [Step::Respond(success_json("writer"))]);
        let mut engine = engine(&worker, vec![gated("plan", "ticket", "writer")]);

        let state = engine.start().await.expect("start").clone();
        assert!(matches!(state, WorkflowState::AwaitingApproval { ref phase, .. } if phase == "plan"));
        assert_eq!(worker.calls("writer"), 0);

        assert_eq!(engine.approve().await, Ok(&WorkflowState::Completed));
        assert_eq!(worker.calls("writer"), 1);
        assert_eq!(engine.records().len(), 2);
        assert_eq!(engine.records()[1].stage, Stage::Execution);
    }

    #[tokio::test(start_paused = true)]
    async fn double_approve_is_rejected() {
        let worker = ScriptedWorker::new();
        worker.script("ticket", [Step::Respond(success_json("ticket"))]);
        worker.script("writer", [Step::Respond(success_json("writer"))]);
        let mut engine = engine(&worker, vec![gated("plan", "ticket", "writer")]);
        engine.start().await.expect("start");
        engine.approve().await.expect("first approve");

        let err = engine.approve().await.unwrap_err();
        assert_eq!(err.state, "completed");
        assert_eq!(worker.calls("writer"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_aborts_with_phase_name() {
        let worker = ScriptedWorker::new();
        worker.script("ticket", [Step::Respond(success_json("ticket"))]);
        let mut engine = engine(&worker, vec![gated("plan", "ticket", "writer")]);
        engine.start().await.expect("start");
        assert_eq!(
            engine.reject().await,
            Ok(&WorkflowState::Aborted {
                reason: "rejected at plan".into()
            })
        );
        assert_eq!(worker.calls("writer"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn modify_merges_details_into_execute_payloads() {
        let worker = ScriptedWorker::new();
        worker.script("ticket", [Step::Respond(success_json("ticket"))]);
        worker.script("writer", [Step::Respond(success_json("writer"))]);
        let mut engine = engine(&worker, vec![gated("plan", "ticket", "writer")]);
        engine.start().await.expect("start");
        engine
            .modify(json!({"scope": "backend only"}))
            .await
            .expect("modify");

        let payloads = worker.payloads("writer");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0][MODIFICATIONS_KEY], json!({"scope": "backend only"}));
        assert_eq!(engine.state(), &WorkflowState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_phase_aborts_unless_configured_to_continue() {
        let worker = ScriptedWorker::new();
        worker.script("probe", [Step::Respond(error_json("probe", ErrorKind::MissingFile))]);
        worker.script("next", [Step::Respond(success_json("next"))]);

        let mut aborting = engine(
            &worker,
            vec![Phase::new("check", leaf("probe")), Phase::new("go", leaf("next"))],
        );
        assert_eq!(
            aborting.start().await,
            Ok(&WorkflowState::Aborted {
                reason: "missing_file from probe".into()
            })
        );
        assert_eq!(aborting.records().len(), 1);

        let mut continuing = engine(
            &worker,
            vec![
                Phase::new("check", leaf("probe")).with_on_failure(OnFailure::Continue),
                Phase::new("go", leaf("next")),
            ],
        );
        assert_eq!(continuing.start().await, Ok(&WorkflowState::Completed));
        assert_eq!(continuing.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_awaiting_approval_aborts() {
        let worker = ScriptedWorker::new();
        worker.script("ticket", [Step::Respond(success_json("ticket"))]);
        let mut engine = engine(&worker, vec![gated("plan", "ticket", "writer")]);
        engine.start().await.expect("start");
        assert_eq!(
            engine.cancel(),
            Ok(&WorkflowState::Aborted {
                reason: "cancelled".into()
            })
        );
        assert!(engine.approve().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_cancel_at_gate_wins_over_later_approval() {
        let worker = ScriptedWorker::new();
        worker.script("ticket", [Step::Respond(success_json("ticket"))]);
        worker.script("writer", [Step::Respond(success_json("writer"))]);
        let mut engine = engine(&worker, vec![gated("plan", "ticket", "writer")]);
        engine.start().await.expect("start");

        engine.cancel_handle().cancel();
        assert_eq!(
            engine.approve().await,
            Ok(&WorkflowState::Aborted {
                reason: "cancelled".into()
            })
        );
        assert_eq!(worker.calls("writer"), 0);
        assert_eq!(engine.records().len(), 1);
        assert!(engine.approve().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_names_worker_in_abort_reason() {
        let worker = ScriptedWorker::new();
        worker.script("x", [Step::Respond("{}".into())]);
        let mut engine = engine(&worker, vec![Phase::new("only", leaf("x"))]);
        assert_eq!(
            engine.start().await,
            Ok(&WorkflowState::Aborted {
                reason: "validation_failure from x".into()
            })
        );
    }
}

//! Test-only helpers: scripted workers and envelope builders.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::envelope::{Envelope, ErrorKind, Warning};
use crate::invoke::InvocationRequest;
use crate::io::worker::{CallError, WorkerCall, WorkerClient};
use crate::schedule::ScheduleNode;

/// One scripted reaction to a call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this raw output immediately.
    Respond(String),
    /// Sleep, then return this raw output.
    Delay(Duration, String),
    /// Report a transport timeout.
    Timeout,
    Transport(String),
    /// Never answer.
    Hang,
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    /// Repeated once `steps` runs dry.
    last: Option<Step>,
    calls: usize,
    payloads: Vec<Value>,
}

/// Worker client driven by per-worker scripts.
///
/// Each call consumes the next step of the worker's script; the final step
/// repeats forever. Unscripted workers fail with a transport error.
#[derive(Clone, Default)]
pub struct ScriptedWorker {
    scripts: Arc<Mutex<BTreeMap<String, Script>>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, worker_id: &str, steps: impl IntoIterator<Item = Step>) {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        let script = scripts.entry(worker_id.to_string()).or_default();
        script.steps.extend(steps);
    }

    /// Number of calls `worker_id` received.
    pub fn calls(&self, worker_id: &str) -> usize {
        let scripts = self.scripts.lock().expect("scripts lock");
        scripts.get(worker_id).map_or(0, |s| s.calls)
    }

    /// Payloads `worker_id` received, in call order.
    pub fn payloads(&self, worker_id: &str) -> Vec<Value> {
        let scripts = self.scripts.lock().expect("scripts lock");
        scripts
            .get(worker_id)
            .map(|s| s.payloads.clone())
            .unwrap_or_default()
    }

    fn next_step(&self, call: &WorkerCall) -> Option<Step> {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        let script = scripts.entry(call.worker_id.clone()).or_default();
        script.calls += 1;
        script.payloads.push(call.payload.clone());
        match script.steps.pop_front() {
            Some(step) => {
                script.last = Some(step.clone());
                Some(step)
            }
            None => script.last.clone(),
        }
    }
}

#[async_trait]
impl WorkerClient for ScriptedWorker {
    async fn invoke(&self, call: &WorkerCall) -> Result<String, CallError> {
        match self.next_step(call) {
            Some(Step::Respond(raw)) => Ok(raw),
            Some(Step::Delay(delay, raw)) => {
                tokio::time::sleep(delay).await;
                Ok(raw)
            }
            Some(Step::Timeout) => Err(CallError::Timeout),
            Some(Step::Transport(message)) => Err(CallError::Transport(message)),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(CallError::Transport(format!(
                "no script for worker {}",
                call.worker_id
            ))),
        }
    }
}

/// Leaf node calling `worker_id` with operation `analyze` and an empty payload.
pub fn leaf(worker_id: &str) -> ScheduleNode {
    ScheduleNode::Leaf(InvocationRequest::new(worker_id, "analyze", json!({})))
}

/// Raw `success` envelope from `agent` with an empty issue list.
pub fn success_json(agent: &str) -> String {
    let mut result = Map::new();
    result.insert("issues".into(), json!([]));
    Envelope::success(agent, "analyze", result)
        .with_execution_time_ms(5)
        .to_json()
}

/// Raw `partial` envelope from `agent` carrying `warnings`.
pub fn partial_json(agent: &str, warnings: Vec<Warning>) -> String {
    Envelope::partial(agent, "analyze", Map::new(), warnings)
        .with_execution_time_ms(5)
        .to_json()
}

/// Raw `error` envelope from `agent`.
pub fn error_json(agent: &str, kind: ErrorKind) -> String {
    Envelope::error(
        agent,
        kind,
        format!("{agent} failed with {kind}"),
        vec![format!("check {agent} input")],
    )
    .with_execution_time_ms(5)
    .to_json()
}

/// A warning with deterministic text.
pub fn warning(kind: &str) -> Warning {
    Warning::new(
        kind,
        format!("{kind} happened"),
        "reduced coverage",
        "re-run with more context",
    )
}

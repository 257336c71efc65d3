//! Workflow definition load helpers with schema + invariant validation.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::outcome::FailurePolicy;
use crate::core::predicate::Predicate;
use crate::invoke::InvocationRequest;
use crate::schedule::ScheduleNode;
use crate::workflow::{ApprovalGate, OnFailure, Phase, WorkflowDefinition};

pub const WORKFLOW_SCHEMA: &str = include_str!("../../schemas/workflow/v1.schema.json");

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    name: String,
    phases: Vec<PhaseSpec>,
}

#[derive(Debug, Deserialize)]
struct PhaseSpec {
    name: String,
    schedule: NodeSpec,
    #[serde(default)]
    policy: FailurePolicy,
    #[serde(default)]
    on_failure: OnFailure,
    #[serde(default)]
    gate: Option<GateSpec>,
}

#[derive(Debug, Deserialize)]
struct GateSpec {
    #[serde(default)]
    execute: Option<NodeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NodeSpec {
    Parallel(Vec<NodeSpec>),
    Sequential(Vec<NodeSpec>),
    Conditional(Box<ConditionalSpec>),
    Leaf(LeafSpec),
}

#[derive(Debug, Deserialize)]
struct ConditionalSpec {
    when: Predicate,
    then: NodeSpec,
    #[serde(default)]
    otherwise: Option<NodeSpec>,
}

#[derive(Debug, Deserialize)]
struct LeafSpec {
    worker: String,
    operation: String,
    #[serde(default = "empty_object")]
    payload: Value,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl From<NodeSpec> for ScheduleNode {
    fn from(spec: NodeSpec) -> Self {
        match spec {
            NodeSpec::Parallel(children) => {
                ScheduleNode::Parallel(children.into_iter().map(Into::into).collect())
            }
            NodeSpec::Sequential(children) => {
                ScheduleNode::Sequential(children.into_iter().map(Into::into).collect())
            }
            NodeSpec::Conditional(spec) => {
                let ConditionalSpec {
                    when,
                    then,
                    otherwise,
                } = *spec;
                ScheduleNode::Conditional {
                    when,
                    then: Box::new(then.into()),
                    otherwise: otherwise.map(|node| Box::new(node.into())),
                }
            }
            NodeSpec::Leaf(leaf) => ScheduleNode::Leaf(InvocationRequest {
                worker_id: leaf.worker,
                operation: leaf.operation,
                payload: leaf.payload,
                timeout: leaf.timeout_ms.map(Duration::from_millis),
                max_retries: leaf.max_retries,
                backoff_base: leaf.backoff_base_ms.map(Duration::from_millis),
            }),
        }
    }
}

impl From<DefinitionFile> for WorkflowDefinition {
    fn from(file: DefinitionFile) -> Self {
        let phases = file
            .phases
            .into_iter()
            .map(|spec| Phase {
                name: spec.name,
                schedule: spec.schedule.into(),
                policy: spec.policy,
                gate: spec.gate.map(|gate| ApprovalGate {
                    execute: gate.execute.map(Into::into),
                }),
                on_failure: spec.on_failure,
            })
            .collect();
        WorkflowDefinition {
            name: file.name,
            phases,
        }
    }
}

/// Load and validate a workflow definition from disk (schema + invariants).
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read workflow {}", path.display()))?;
    parse_definition(&contents).with_context(|| format!("load workflow {}", path.display()))
}

/// Parse and validate a workflow definition document.
pub fn parse_definition(raw: &str) -> Result<WorkflowDefinition> {
    let value: Value = serde_json::from_str(raw).context("parse workflow json")?;
    validate_schema(&value)?;
    let file: DefinitionFile =
        serde_json::from_value(value).context("deserialize workflow definition")?;
    let definition = WorkflowDefinition::from(file);
    let errors = validate_invariants(&definition);
    if !errors.is_empty() {
        return Err(anyhow!(
            "workflow invariants failed: {}",
            errors.join("; ")
        ));
    }
    Ok(definition)
}

fn validate_schema(definition: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(WORKFLOW_SCHEMA).context("parse workflow schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(definition) {
        let messages = compiled
            .iter_errors(definition)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "workflow schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Semantic checks the schema cannot express. Returns one message per violation.
pub fn validate_invariants(definition: &WorkflowDefinition) -> Vec<String> {
    let mut errors = Vec::new();
    let mut names = BTreeSet::new();
    for phase in &definition.phases {
        if phase.name.trim().is_empty() {
            errors.push("phase name must not be empty".to_string());
        } else if !names.insert(phase.name.as_str()) {
            errors.push(format!("duplicate phase name {}", phase.name));
        }
        check_schedule(&phase.name, "schedule", &phase.schedule, &mut errors);
        if let Some(execute) = phase.gate.as_ref().and_then(|g| g.execute.as_ref()) {
            check_schedule(&phase.name, "gate.execute", execute, &mut errors);
        }
    }
    errors
}

fn check_schedule(phase: &str, label: &str, node: &ScheduleNode, errors: &mut Vec<String>) {
    let ids = node.leaf_ids();
    let mut seen = BTreeSet::new();
    for id in &ids {
        if id.trim().is_empty() {
            errors.push(format!("{phase}.{label}: worker id must not be empty"));
        } else if !seen.insert(*id) {
            errors.push(format!("{phase}.{label}: worker {id} appears more than once"));
        }
    }
    check_node(phase, label, node, &seen, errors);
}

fn check_node(
    phase: &str,
    label: &str,
    node: &ScheduleNode,
    leaves: &BTreeSet<&str>,
    errors: &mut Vec<String>,
) {
    match node {
        ScheduleNode::Parallel(children) | ScheduleNode::Sequential(children) => {
            for child in children {
                check_node(phase, label, child, leaves, errors);
            }
        }
        ScheduleNode::Conditional {
            when,
            then,
            otherwise,
        } => {
            for worker in when.referenced_workers() {
                if !leaves.contains(worker) {
                    errors.push(format!(
                        "{phase}.{label}: condition references unknown worker {worker}"
                    ));
                }
            }
            check_node(phase, label, then, leaves, errors);
            if let Some(otherwise) = otherwise {
                check_node(phase, label, otherwise, leaves, errors);
            }
        }
        ScheduleNode::Leaf(request) => {
            if request.operation.trim().is_empty() {
                errors.push(format!(
                    "{phase}.{label}: operation for {} must not be empty",
                    request.worker_id
                ));
            }
        }
    }
}

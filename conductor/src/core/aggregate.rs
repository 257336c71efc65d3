//! Merge a phase's outcomes into one report.
//!
//! Output order never depends on completion order: worker lists are sorted
//! lexically and tagged items by `(worker_id, index)`.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::envelope::{EnvelopeStatus, Warning};
use crate::core::outcome::{InvocationOutcome, PhaseResult, PhaseStatus};

/// Warning type synthesized for each failed worker.
pub const WORKER_FAILED: &str = "worker_failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedWarning {
    pub worker_id: String,
    pub index: usize,
    #[serde(flatten)]
    pub warning: Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedIssue {
    pub worker_id: String,
    pub index: usize,
    pub issue: Value,
}

/// Aggregated view of one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub status: PhaseStatus,
    pub succeeded: Vec<String>,
    pub degraded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub cancelled: Vec<String>,
    pub warnings: Vec<TaggedWarning>,
    pub issues: Vec<TaggedIssue>,
    pub results: BTreeMap<String, Map<String, Value>>,
}

/// Anything that can be reduced to a [`PhaseReport`].
pub trait Aggregate {
    fn aggregate(&self) -> PhaseReport;
}

pub fn aggregate<A: Aggregate + ?Sized>(input: &A) -> PhaseReport {
    input.aggregate()
}

impl Aggregate for PhaseResult {
    fn aggregate(&self) -> PhaseReport {
        let mut report = PhaseReport {
            status: self.status(),
            succeeded: Vec::new(),
            degraded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            cancelled: Vec::new(),
            warnings: Vec::new(),
            issues: Vec::new(),
            results: BTreeMap::new(),
        };

        for (worker_id, outcome) in self.outcomes() {
            let own_warnings = outcome.envelope().map_or(0, |e| e.warnings.len());
            if let Some(envelope) = outcome.envelope() {
                for (index, warning) in envelope.warnings.iter().enumerate() {
                    report.warnings.push(TaggedWarning {
                        worker_id: worker_id.clone(),
                        index,
                        warning: warning.clone(),
                    });
                }
                if let Some(result) = envelope.result() {
                    if let Some(Value::Array(items)) = result.get("issues") {
                        for (index, issue) in items.iter().enumerate() {
                            report.issues.push(TaggedIssue {
                                worker_id: worker_id.clone(),
                                index,
                                issue: issue.clone(),
                            });
                        }
                    }
                    report.results.insert(worker_id.clone(), result.clone());
                }
            }

            match outcome {
                InvocationOutcome::Envelope(envelope)
                    if envelope.status == EnvelopeStatus::Success =>
                {
                    report.succeeded.push(worker_id.clone());
                }
                InvocationOutcome::Envelope(envelope)
                    if envelope.status == EnvelopeStatus::Partial =>
                {
                    report.degraded.push(worker_id.clone());
                }
                InvocationOutcome::Skipped => report.skipped.push(worker_id.clone()),
                InvocationOutcome::Cancelled => report.cancelled.push(worker_id.clone()),
                _ => {
                    report.failed.push(worker_id.clone());
                    report.warnings.push(TaggedWarning {
                        worker_id: worker_id.clone(),
                        index: own_warnings,
                        warning: failure_warning(worker_id, outcome),
                    });
                }
            }
        }

        normalize(report)
    }
}

impl Aggregate for PhaseReport {
    fn aggregate(&self) -> PhaseReport {
        normalize(self.clone())
    }
}

fn failure_warning(worker_id: &str, outcome: &InvocationOutcome) -> Warning {
    let message = outcome
        .describe_failure()
        .unwrap_or_else(|| format!("{worker_id} failed"));
    let recovery = outcome
        .recovery_hint()
        .map(str::to_string)
        .unwrap_or_else(|| format!("inspect {worker_id} and re-run the phase"));
    Warning::new(
        WORKER_FAILED,
        format!("{worker_id}: {message}"),
        format!("results from {worker_id} are missing from this phase"),
        recovery,
    )
}

fn normalize(mut report: PhaseReport) -> PhaseReport {
    for list in [
        &mut report.succeeded,
        &mut report.degraded,
        &mut report.failed,
        &mut report.skipped,
        &mut report.cancelled,
    ] {
        list.sort();
        list.dedup();
    }
    report
        .warnings
        .sort_by(|a, b| (&a.worker_id, a.index).cmp(&(&b.worker_id, b.index)));
    report
        .issues
        .sort_by(|a, b| (&a.worker_id, a.index).cmp(&(&b.worker_id, b.index)));
    report
}

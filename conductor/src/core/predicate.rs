//! Predicates that pick the branch of a conditional schedule node.
//!
//! A predicate is evaluated against the outcomes accumulated so far in the
//! current phase. Workers that have not produced an outcome yet satisfy
//! neither `succeeded` nor `failed`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::envelope::EnvelopeStatus;
use crate::core::outcome::PhaseResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    /// Worker returned a `success` or `partial` envelope.
    Succeeded { worker: String },
    Failed { worker: String },
    Status { worker: String, status: EnvelopeStatus },
    /// JSON pointer into the worker's `result` equals `value`.
    ResultEquals {
        worker: String,
        pointer: String,
        value: Value,
    },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn succeeded(worker: impl Into<String>) -> Self {
        Predicate::Succeeded {
            worker: worker.into(),
        }
    }

    pub fn failed(worker: impl Into<String>) -> Self {
        Predicate::Failed {
            worker: worker.into(),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    /// Worker ids this predicate looks at.
    pub fn referenced_workers(&self) -> Vec<&str> {
        match self {
            Predicate::Always => Vec::new(),
            Predicate::Succeeded { worker }
            | Predicate::Failed { worker }
            | Predicate::Status { worker, .. }
            | Predicate::ResultEquals { worker, .. } => vec![worker.as_str()],
            Predicate::All { of } | Predicate::Any { of } => {
                of.iter().flat_map(Predicate::referenced_workers).collect()
            }
            Predicate::Not { predicate } => predicate.referenced_workers(),
        }
    }

    pub fn evaluate(&self, result: &PhaseResult) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Succeeded { worker } => result.outcome(worker).is_some_and(|o| o.is_ok()),
            Predicate::Failed { worker } => {
                result.outcome(worker).is_some_and(|o| o.is_failure())
            }
            Predicate::Status { worker, status } => result
                .outcome(worker)
                .and_then(|o| o.envelope())
                .is_some_and(|e| e.status == *status),
            Predicate::ResultEquals {
                worker,
                pointer,
                value,
            } => result
                .outcome(worker)
                .and_then(|o| o.envelope())
                .and_then(|e| e.result())
                .is_some_and(|r| {
                    if pointer.is_empty() {
                        return value.as_object() == Some(r);
                    }
                    lookup(r, pointer).is_some_and(|found| found == value)
                }),
            Predicate::All { of } => of.iter().all(|p| p.evaluate(result)),
            Predicate::Any { of } => of.iter().any(|p| p.evaluate(result)),
            Predicate::Not { predicate } => !predicate.evaluate(result),
        }
    }
}

/// Resolve an RFC 6901 pointer against a result object.
fn lookup<'a>(result: &'a Map<String, Value>, pointer: &str) -> Option<&'a Value> {
    let rest = pointer.strip_prefix('/')?;
    let (head, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let key = head.replace("~1", "/").replace("~0", "~");
    result.get(&key)?.pointer(tail)
}

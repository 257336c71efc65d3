//! Invocation outcomes and the per-phase result they accumulate into.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::envelope::{Body, Envelope, EnvelopeStatus};
use crate::core::validator::ValidationFailure;

/// How a composition reacts when one of its leaves fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop scheduling new work and cancel in-flight siblings.
    FailFast,
    #[default]
    ContinueOnError,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => f.write_str("fail-fast"),
            FailurePolicy::ContinueOnError => f.write_str("continue-on-error"),
        }
    }
}

/// Last transient failure seen before retries ran out.
#[derive(Debug, Clone, PartialEq)]
pub enum LastError {
    Envelope(Envelope),
    Transport(String),
}

/// Final result of one request, after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// A contract-valid envelope of any status.
    Envelope(Envelope),
    ValidationFailure {
        raw: String,
        failure: ValidationFailure,
    },
    Timeout {
        after: Duration,
    },
    ExhaustedRetries {
        attempts: u32,
        last: LastError,
    },
    /// Never started (fail-fast stop, cancellation, or untaken branch).
    Skipped,
    /// In flight when the phase was cancelled.
    Cancelled,
}

impl InvocationOutcome {
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            InvocationOutcome::Envelope(envelope) => Some(envelope),
            _ => None,
        }
    }

    /// A `success` or `partial` envelope.
    pub fn is_ok(&self) -> bool {
        self.envelope().is_some_and(|envelope| !envelope.is_error())
    }

    pub fn is_failure(&self) -> bool {
        match self {
            InvocationOutcome::Envelope(envelope) => envelope.is_error(),
            InvocationOutcome::ValidationFailure { .. }
            | InvocationOutcome::Timeout { .. }
            | InvocationOutcome::ExhaustedRetries { .. } => true,
            InvocationOutcome::Skipped | InvocationOutcome::Cancelled => false,
        }
    }

    /// Short name for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            InvocationOutcome::Envelope(envelope) => envelope.status.as_str(),
            InvocationOutcome::ValidationFailure { .. } => "validation_failure",
            InvocationOutcome::Timeout { .. } => "timeout",
            InvocationOutcome::ExhaustedRetries { .. } => "exhausted_retries",
            InvocationOutcome::Skipped => "skipped",
            InvocationOutcome::Cancelled => "cancelled",
        }
    }

    /// Error category of a failed outcome (`access_denied`, `timeout`, ...).
    pub fn error_label(&self) -> Option<String> {
        match self {
            InvocationOutcome::Envelope(envelope) => {
                envelope.error_kind().map(|kind| kind.as_str().to_string())
            }
            InvocationOutcome::ValidationFailure { .. } => Some("validation_failure".to_string()),
            InvocationOutcome::Timeout { .. } => Some("timeout".to_string()),
            InvocationOutcome::ExhaustedRetries { last, .. } => Some(match last {
                LastError::Envelope(envelope) => envelope
                    .error_kind()
                    .map_or("internal_error", |kind| kind.as_str())
                    .to_string(),
                LastError::Transport(_) => "transport_error".to_string(),
            }),
            InvocationOutcome::Skipped | InvocationOutcome::Cancelled => None,
        }
    }

    /// Human-readable description of a failed outcome.
    pub fn describe_failure(&self) -> Option<String> {
        match self {
            InvocationOutcome::Envelope(envelope) => match &envelope.body {
                Body::Failed { kind, message, .. } => {
                    Some(format!("{kind}: {message}"))
                }
                Body::Completed { .. } => None,
            },
            InvocationOutcome::ValidationFailure { failure, .. } => {
                Some(format!("response violated the contract at {failure}"))
            }
            InvocationOutcome::Timeout { after } => {
                Some(format!("no response within {}ms", after.as_millis()))
            }
            InvocationOutcome::ExhaustedRetries { attempts, last } => {
                let detail = match last {
                    LastError::Envelope(envelope) => match &envelope.body {
                        Body::Failed { kind, message, .. } => {
                            format!("{kind}: {message}")
                        }
                        Body::Completed { .. } => {
                            envelope.status.to_string()
                        }
                    },
                    LastError::Transport(message) => format!("transport error: {message}"),
                };
                Some(format!("gave up after {attempts} attempts ({detail})"))
            }
            InvocationOutcome::Skipped | InvocationOutcome::Cancelled => None,
        }
    }

    /// First recovery suggestion the worker offered, if any.
    pub fn recovery_hint(&self) -> Option<&str> {
        let envelope = match self {
            InvocationOutcome::Envelope(envelope) => envelope,
            InvocationOutcome::ExhaustedRetries {
                last: LastError::Envelope(envelope),
                ..
            } => envelope,
            _ => return None,
        };
        match &envelope.body {
            Body::Failed {
                recovery_suggestions,
                ..
            } => recovery_suggestions.first().map(String::as_str),
            Body::Completed { .. } => None,
        }
    }
}

/// Derived status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseStatus::Success => "success",
            PhaseStatus::Partial => "partial",
            PhaseStatus::Failed => "failed",
        })
    }
}

/// Outcomes of every leaf of one schedule evaluation, keyed by worker id.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    outcomes: BTreeMap<String, InvocationOutcome>,
    policy: FailurePolicy,
    first_failure: Option<String>,
    cancelled: bool,
}

impl PhaseResult {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            outcomes: BTreeMap::new(),
            policy,
            first_failure: None,
            cancelled: false,
        }
    }

    /// Record a leaf outcome. The first failure recorded is remembered.
    pub fn record(&mut self, worker_id: impl Into<String>, outcome: InvocationOutcome) {
        let worker_id = worker_id.into();
        if outcome.is_failure() && self.first_failure.is_none() {
            self.first_failure = Some(worker_id.clone());
        }
        self.outcomes.insert(worker_id, outcome);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn outcomes(&self) -> &BTreeMap<String, InvocationOutcome> {
        &self.outcomes
    }

    pub fn outcome(&self, worker_id: &str) -> Option<&InvocationOutcome> {
        self.outcomes.get(worker_id)
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn first_failure(&self) -> Option<(&str, &InvocationOutcome)> {
        let id = self.first_failure.as_deref()?;
        self.outcomes.get(id).map(|outcome| (id, outcome))
    }

    pub fn status(&self) -> PhaseStatus {
        if self.cancelled {
            return PhaseStatus::Failed;
        }
        let mut ok = 0usize;
        let mut failed = 0usize;
        let mut partial = false;
        for outcome in self.outcomes.values() {
            if outcome.is_failure() {
                failed += 1;
            } else if outcome.is_ok() {
                ok += 1;
                partial |= outcome
                    .envelope()
                    .is_some_and(|e| e.status == EnvelopeStatus::Partial);
            }
        }
        if failed > 0 {
            if self.policy == FailurePolicy::FailFast || ok == 0 {
                return PhaseStatus::Failed;
            }
            return PhaseStatus::Partial;
        }
        if partial {
            PhaseStatus::Partial
        } else {
            PhaseStatus::Success
        }
    }

    /// Abort reason for a failed phase: `"<error_kind> from <worker_id>"`.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some((id, outcome)) = self.first_failure() {
            let label = outcome
                .error_label()
                .unwrap_or_else(|| "failure".to_string());
            return Some(format!("{label} from {id}"));
        }
        if self.cancelled {
            return Some("cancelled".to_string());
        }
        None
    }
}

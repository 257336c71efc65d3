//! Single-request worker invocation with timeout, validation and retry.
//!
//! [`WorkerInvoker::invoke`] never fails: every way a call can go wrong ends
//! up as an [`InvocationOutcome`] variant. Transient failures (configured
//! error kinds and transport errors) are retried with exponential backoff;
//! contract violations and permanent errors are returned after one attempt.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::backoff;
use crate::core::envelope::ErrorKind;
use crate::core::outcome::{InvocationOutcome, LastError};
use crate::core::validator::EnvelopeValidator;
use crate::io::worker::{CallError, WorkerCall, WorkerClient};

/// One unit of work addressed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub worker_id: String,
    pub operation: String,
    pub payload: Value,
    /// Overrides [`InvokerSettings::timeout`] for this request.
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub backoff_base: Option<Duration>,
}

impl InvocationRequest {
    pub fn new(worker_id: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            worker_id: worker_id.into(),
            operation: operation.into(),
            payload,
            timeout: None,
            max_retries: None,
            backoff_base: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = Some(backoff_base);
        self
    }
}

/// Invoker defaults, overridable per request.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokerSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Random stretch of each backoff delay, as a fraction (`0.0` disables).
    pub jitter: f64,
    /// Error kinds worth retrying.
    pub transient: BTreeSet<ErrorKind>,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            jitter: 0.0,
            transient: BTreeSet::from([ErrorKind::Timeout, ErrorKind::InternalError]),
        }
    }
}

/// Outcome of [`WorkerInvoker::invoke`] plus how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub outcome: InvocationOutcome,
    pub attempts: u32,
}

pub struct WorkerInvoker {
    client: Arc<dyn WorkerClient>,
    validator: EnvelopeValidator,
    settings: InvokerSettings,
}

impl WorkerInvoker {
    pub fn new(
        client: Arc<dyn WorkerClient>,
        validator: EnvelopeValidator,
        settings: InvokerSettings,
    ) -> Self {
        Self {
            client,
            validator,
            settings,
        }
    }

    #[instrument(skip_all, fields(worker = %request.worker_id, operation = %request.operation))]
    pub async fn invoke(&self, request: &InvocationRequest) -> Invocation {
        let timeout = request.timeout.unwrap_or(self.settings.timeout);
        let max_retries = request.max_retries.unwrap_or(self.settings.max_retries);
        let backoff_base = request.backoff_base.unwrap_or(self.settings.backoff_base);
        let call = WorkerCall {
            worker_id: request.worker_id.clone(),
            operation: request.operation.clone(),
            payload: request.payload.clone(),
            timeout,
        };

        let mut attempts = 0u32;
        let mut retries_used = 0u32;
        loop {
            attempts += 1;
            debug!(attempt = attempts, "calling worker");
            let last = match tokio::time::timeout(timeout, self.client.invoke(&call)).await {
                Err(_) | Ok(Err(CallError::Timeout)) => {
                    warn!(
                        attempt = attempts,
                        timeout_ms = timeout.as_millis() as u64,
                        "worker timed out"
                    );
                    return Invocation {
                        outcome: InvocationOutcome::Timeout { after: timeout },
                        attempts,
                    };
                }
                Ok(Err(CallError::Transport(message))) => {
                    warn!(attempt = attempts, error = %message, "worker transport failed");
                    LastError::Transport(message)
                }
                Ok(Ok(raw)) => match self.validator.validate(&raw, Some(&request.worker_id)) {
                    Err(failure) => {
                        warn!(attempt = attempts, %failure, "worker output violates contract");
                        return Invocation {
                            outcome: InvocationOutcome::ValidationFailure { raw, failure },
                            attempts,
                        };
                    }
                    Ok(envelope) => match envelope.error_kind() {
                        Some(kind) if self.settings.transient.contains(&kind) => {
                            warn!(attempt = attempts, error_kind = %kind, "transient worker error");
                            LastError::Envelope(envelope)
                        }
                        _ => {
                            debug!(attempt = attempts, status = %envelope.status, "worker answered");
                            return Invocation {
                                outcome: InvocationOutcome::Envelope(envelope),
                                attempts,
                            };
                        }
                    },
                },
            };

            if retries_used >= max_retries {
                warn!(attempts, "retries exhausted");
                return Invocation {
                    outcome: InvocationOutcome::ExhaustedRetries { attempts, last },
                    attempts,
                };
            }
            let delay = {
                let base = backoff::delay_for(backoff_base, retries_used);
                backoff::with_jitter(base, self.settings.jitter, &mut rand::thread_rng())
            };
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
            retries_used += 1;
        }
    }
}

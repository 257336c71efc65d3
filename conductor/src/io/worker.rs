//! Worker call boundary.
//!
//! The [`WorkerClient`] trait decouples invocation from the transport that
//! reaches a worker. [`ProcessWorker`] runs a configured command; tests use
//! scripted clients that return predetermined output without spawning
//! processes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::io::process::run_process;

/// One attempt sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerCall {
    pub worker_id: String,
    pub operation: String,
    pub payload: Value,
    #[serde(rename = "timeout_ms", serialize_with = "as_millis")]
    pub timeout: Duration,
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Why a call produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    Timeout,
    /// The worker could not be reached or died without answering.
    Transport(String),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout => f.write_str("worker timed out"),
            CallError::Transport(message) => write!(f, "transport error: {message}"),
        }
    }
}

impl std::error::Error for CallError {}

/// Abstraction over worker transports.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Send one call and return the worker's raw response text.
    async fn invoke(&self, call: &WorkerCall) -> Result<String, CallError>;
}

/// Routes calls to per-worker clients by worker id.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    clients: BTreeMap<String, Arc<dyn WorkerClient>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_id: impl Into<String>, client: Arc<dyn WorkerClient>) {
        self.clients.insert(worker_id.into(), client);
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.clients.contains_key(worker_id)
    }
}

#[async_trait]
impl WorkerClient for WorkerRegistry {
    async fn invoke(&self, call: &WorkerCall) -> Result<String, CallError> {
        match self.clients.get(&call.worker_id) {
            Some(client) => client.invoke(call).await,
            None => Err(CallError::Transport(format!(
                "no worker registered for '{}'",
                call.worker_id
            ))),
        }
    }
}

/// Worker reached by spawning a command.
///
/// The call is written to stdin as one JSON document; stdout is the raw
/// response. A run that exits non-zero without writing anything is a
/// transport error, otherwise stdout is handed to validation as-is.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl ProcessWorker {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl WorkerClient for ProcessWorker {
    #[instrument(skip_all, fields(worker = %call.worker_id, operation = %call.operation))]
    async fn invoke(&self, call: &WorkerCall) -> Result<String, CallError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CallError::Transport("empty worker command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let input = serde_json::to_vec(call)
            .map_err(|err| CallError::Transport(format!("serialize call: {err}")))?;
        let output = run_process(cmd, Some(input), call.timeout, self.output_limit_bytes)
            .await
            .map_err(|err| CallError::Transport(format!("{err:#}")))?;

        if output.timed_out {
            return Err(CallError::Timeout);
        }
        if output.stdout.dropped > 0 {
            warn!(
                dropped = output.stdout.dropped,
                "worker stdout exceeded output limit"
            );
        }
        if output.stdout.is_blank() && !output.status.success() {
            return Err(CallError::Transport(format!(
                "worker exited with {}: {}",
                output.status,
                output.stderr.lossy().trim()
            )));
        }
        debug!(bytes = output.stdout.bytes.len(), "worker responded");
        Ok(output.stdout.lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl WorkerClient for Echo {
        async fn invoke(&self, call: &WorkerCall) -> Result<String, CallError> {
            Ok(call.operation.clone())
        }
    }

    fn call(worker_id: &str) -> WorkerCall {
        WorkerCall {
            worker_id: worker_id.to_string(),
            operation: "analyze".to_string(),
            payload: json!({"ticket": 7}),
            timeout: Duration::from_millis(1500),
        }
    }

    #[test]
    fn call_serializes_timeout_in_millis() {
        let value = serde_json::to_value(call("ticket")).expect("serialize");
        assert_eq!(
            value,
            json!({
                "worker_id": "ticket",
                "operation": "analyze",
                "payload": {"ticket": 7},
                "timeout_ms": 1500
            })
        );
    }

    #[tokio::test]
    async fn registry_routes_by_worker_id() {
        let mut registry = WorkerRegistry::new();
        registry.register("ticket", Arc::new(Echo));
        assert_eq!(registry.invoke(&call("ticket")).await, Ok("analyze".into()));
        let err = registry.invoke(&call("design")).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(msg) if msg.contains("design")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_worker_reads_stdout() {
        let worker = ProcessWorker::new(
            vec!["sh".into(), "-c".into(), "cat >/dev/null; echo '{\"ok\":true}'".into()],
            10_000,
        );
        let raw = worker.invoke(&call("ticket")).await.expect("invoke");
        assert_eq!(raw.trim(), "{\"ok\":true}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_failure_is_transport_error() {
        let worker = ProcessWorker::new(
            vec!["sh".into(), "-c".into(), "echo nope >&2; exit 3".into()],
            10_000,
        );
        let err = worker.invoke(&call("ticket")).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(msg) if msg.contains("nope")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_process_times_out() {
        let worker = ProcessWorker::new(vec!["sleep".into(), "5".into()], 10_000);
        let mut slow = call("ticket");
        slow.timeout = Duration::from_millis(100);
        assert_eq!(worker.invoke(&slow).await, Err(CallError::Timeout));
    }
}

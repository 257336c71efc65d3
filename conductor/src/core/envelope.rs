//! Worker response envelope.
//!
//! Every worker answers with the same wrapper: a status, the id of the agent
//! that produced it, a contract version, either a completed body (operation +
//! result) or a failure body (error kind + message + recovery suggestions),
//! warnings, and execution metadata. Only the wrapper is typed; `result` stays
//! an opaque JSON object.
//!
//! Values of [`Envelope`] are only produced by the validator or the
//! constructors below, so the status always agrees with the body.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Contract version written by [`Envelope`] constructors.
pub const CONTRACT_VERSION: &str = "1.0";

/// Top-level envelope status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Partial,
    Error,
}

impl EnvelopeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeStatus::Success => "success",
            EnvelopeStatus::Partial => "partial",
            EnvelopeStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(EnvelopeStatus::Success),
            "partial" => Some(EnvelopeStatus::Partial),
            "error" => Some(EnvelopeStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-declared error category (`error_type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingFile,
    InvalidInput,
    ParseError,
    AccessDenied,
    Timeout,
    InternalError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::MissingFile,
        ErrorKind::InvalidInput,
        ErrorKind::ParseError,
        ErrorKind::AccessDenied,
        ErrorKind::Timeout,
        ErrorKind::InternalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingFile => "missing_file",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A degradation notice attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub impact: String,
    pub recovery: String,
}

impl Warning {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        impact: impl Into<String>,
        recovery: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            impact: impact.into(),
            recovery: recovery.into(),
        }
    }
}

/// Execution metadata. Keys other than `execution_time_ms` are preserved as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub execution_time_ms: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Status-specific part of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// `success` or `partial`: the operation ran and produced a result object.
    Completed {
        operation: String,
        result: Map<String, Value>,
    },
    /// `error`: the worker refused or failed.
    Failed {
        kind: ErrorKind,
        message: String,
        recovery_suggestions: Vec<String>,
    },
}

/// A contract-conformant worker response.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    pub agent: String,
    pub version: String,
    pub body: Body,
    pub warnings: Vec<Warning>,
    pub metadata: Metadata,
}

impl Envelope {
    pub fn success(
        agent: impl Into<String>,
        operation: impl Into<String>,
        result: Map<String, Value>,
    ) -> Self {
        Self::completed(EnvelopeStatus::Success, agent, operation, result, Vec::new())
    }

    pub fn partial(
        agent: impl Into<String>,
        operation: impl Into<String>,
        result: Map<String, Value>,
        warnings: Vec<Warning>,
    ) -> Self {
        Self::completed(EnvelopeStatus::Partial, agent, operation, result, warnings)
    }

    pub fn error(
        agent: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        recovery_suggestions: Vec<String>,
    ) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            agent: agent.into(),
            version: CONTRACT_VERSION.to_string(),
            body: Body::Failed {
                kind,
                message: message.into(),
                recovery_suggestions,
            },
            warnings: Vec::new(),
            metadata: Metadata::default(),
        }
    }

    fn completed(
        status: EnvelopeStatus,
        agent: impl Into<String>,
        operation: impl Into<String>,
        result: Map<String, Value>,
        warnings: Vec<Warning>,
    ) -> Self {
        Self {
            status,
            agent: agent.into(),
            version: CONTRACT_VERSION.to_string(),
            body: Body::Completed {
                operation: operation.into(),
                result,
            },
            warnings,
            metadata: Metadata::default(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_execution_time_ms(mut self, ms: u64) -> Self {
        self.metadata.execution_time_ms = ms;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == EnvelopeStatus::Error
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.body {
            Body::Failed { kind, .. } => Some(*kind),
            Body::Completed { .. } => None,
        }
    }

    pub fn operation(&self) -> Option<&str> {
        match &self.body {
            Body::Completed { operation, .. } => Some(operation),
            Body::Failed { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&Map<String, Value>> {
        match &self.body {
            Body::Completed { result, .. } => Some(result),
            Body::Failed { .. } => None,
        }
    }

    /// Render the envelope in its wire shape.
    ///
    /// `warnings` is always written for `partial` and omitted elsewhere when empty.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("status".into(), Value::from(self.status.as_str()));
        obj.insert("agent".into(), Value::from(self.agent.clone()));
        obj.insert("version".into(), Value::from(self.version.clone()));
        match &self.body {
            Body::Completed { operation, result } => {
                obj.insert("operation".into(), Value::from(operation.clone()));
                obj.insert("result".into(), Value::Object(result.clone()));
            }
            Body::Failed {
                kind,
                message,
                recovery_suggestions,
            } => {
                obj.insert("error_type".into(), Value::from(kind.as_str()));
                obj.insert("message".into(), Value::from(message.clone()));
                obj.insert(
                    "recovery_suggestions".into(),
                    Value::from(recovery_suggestions.clone()),
                );
            }
        }
        if self.status == EnvelopeStatus::Partial || !self.warnings.is_empty() {
            let warnings = self
                .warnings
                .iter()
                .map(|w| serde_json::to_value(w).unwrap_or(Value::Null))
                .collect::<Vec<_>>();
            obj.insert("warnings".into(), Value::Array(warnings));
        }
        obj.insert(
            "metadata".into(),
            serde_json::to_value(&self.metadata).unwrap_or_else(|_| Value::Object(Map::new())),
        );
        Value::Object(obj)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

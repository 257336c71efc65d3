//! Contract validation for raw worker output.
//!
//! [`EnvelopeValidator::validate`] is total: every input yields either an
//! [`Envelope`] or a [`ValidationFailure`] naming the offending field. A
//! failure is data, aggregated next to real worker errors, never a panic.
//!
//! Checks run in a fixed order so the reported field is stable:
//! JSON syntax, object shape, `status`, `agent`, `version`, the
//! status-specific body, `warnings`, then `metadata`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::envelope::{Body, Envelope, EnvelopeStatus, ErrorKind, Metadata, Warning};

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(?:\.\d+){0,2}$").expect("version pattern compiles")
});

/// Why a raw output does not satisfy the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub reason: String,
    /// Dotted path to the offending field (`$` for the document itself).
    pub field_path: String,
}

impl ValidationFailure {
    fn new(field_path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            field_path: field_path.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field_path, self.reason)
    }
}

type Check<T> = Result<T, ValidationFailure>;

/// Validates envelopes against the contract and a set of supported major versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeValidator {
    supported_majors: BTreeSet<u64>,
}

impl Default for EnvelopeValidator {
    fn default() -> Self {
        Self::new([1])
    }
}

impl EnvelopeValidator {
    pub fn new(supported_majors: impl IntoIterator<Item = u64>) -> Self {
        Self {
            supported_majors: supported_majors.into_iter().collect(),
        }
    }

    pub fn supported_majors(&self) -> &BTreeSet<u64> {
        &self.supported_majors
    }

    /// Parse and validate raw worker output.
    ///
    /// When `expected_agent` is set, the envelope's `agent` must match it.
    pub fn validate(&self, raw: &str, expected_agent: Option<&str>) -> Check<Envelope> {
        let value: Value = serde_json::from_str(raw.trim())
            .map_err(|err| ValidationFailure::new("$", format!("not valid JSON: {err}")))?;
        self.validate_value(&value, expected_agent)
    }

    /// Validate an already-parsed JSON document.
    pub fn validate_value(&self, value: &Value, expected_agent: Option<&str>) -> Check<Envelope> {
        let obj = value.as_object().ok_or_else(|| {
            ValidationFailure::new("$", format!("expected object, found {}", type_name(value)))
        })?;

        let status_raw = required_str(obj, "status", "status")?;
        let status = EnvelopeStatus::parse(status_raw).ok_or_else(|| {
            ValidationFailure::new(
                "status",
                format!("unknown status '{status_raw}' (expected success, partial or error)"),
            )
        })?;

        let agent = required_str(obj, "agent", "agent")?;
        if agent.trim().is_empty() {
            return Err(ValidationFailure::new("agent", "must not be empty"));
        }
        if let Some(expected) = expected_agent {
            if agent != expected {
                return Err(ValidationFailure::new(
                    "agent",
                    format!("expected '{expected}' but envelope names '{agent}'"),
                ));
            }
        }

        let version = required_str(obj, "version", "version")?;
        self.check_version(version)?;

        let body = match status {
            EnvelopeStatus::Success | EnvelopeStatus::Partial => completed_body(obj)?,
            EnvelopeStatus::Error => failed_body(obj)?,
        };

        let warnings = warnings(obj, status)?;
        let metadata = metadata(obj)?;

        Ok(Envelope {
            status,
            agent: agent.to_string(),
            version: version.to_string(),
            body,
            warnings,
            metadata,
        })
    }

    fn check_version(&self, version: &str) -> Check<()> {
        let captures = VERSION_RE.captures(version).ok_or_else(|| {
            ValidationFailure::new(
                "version",
                format!("malformed version '{version}' (expected MAJOR[.MINOR[.PATCH]])"),
            )
        })?;
        let major = captures[1].parse::<u64>().map_err(|_| {
            ValidationFailure::new("version", format!("major version out of range in '{version}'"))
        })?;
        if !self.supported_majors.contains(&major) {
            let supported = self
                .supported_majors
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ValidationFailure::new(
                "version",
                format!("unsupported major version {major} (supported: {supported})"),
            ));
        }
        Ok(())
    }
}

fn completed_body(obj: &Map<String, Value>) -> Check<Body> {
    for forbidden in ["error_type", "recovery_suggestions"] {
        if obj.contains_key(forbidden) {
            return Err(ValidationFailure::new(
                forbidden,
                "only allowed when status is error",
            ));
        }
    }
    let operation = required_str(obj, "operation", "operation")?;
    let result = match obj.get("result") {
        None => return Err(missing("result")),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => return Err(wrong_type("result", "object", other)),
    };
    Ok(Body::Completed {
        operation: operation.to_string(),
        result,
    })
}

fn failed_body(obj: &Map<String, Value>) -> Check<Body> {
    if obj.contains_key("operation") {
        return Err(ValidationFailure::new(
            "operation",
            "must be absent when status is error",
        ));
    }
    let kind_raw = required_str(obj, "error_type", "error_type")?;
    let kind = ErrorKind::parse(kind_raw).ok_or_else(|| {
        ValidationFailure::new("error_type", format!("unknown error_type '{kind_raw}'"))
    })?;
    let message = required_str(obj, "message", "message")?;
    let suggestions = match obj.get("recovery_suggestions") {
        None => return Err(missing("recovery_suggestions")),
        Some(Value::Array(items)) => items,
        Some(other) => return Err(wrong_type("recovery_suggestions", "array", other)),
    };
    if suggestions.is_empty() {
        return Err(ValidationFailure::new(
            "recovery_suggestions",
            "must contain at least one suggestion",
        ));
    }
    let recovery_suggestions = suggestions
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| wrong_type(&format!("recovery_suggestions[{idx}]"), "string", item))
        })
        .collect::<Check<Vec<_>>>()?;
    Ok(Body::Failed {
        kind,
        message: message.to_string(),
        recovery_suggestions,
    })
}

/// Required on `partial`; elsewhere it may be absent or empty, but never populated.
fn warnings(obj: &Map<String, Value>, status: EnvelopeStatus) -> Check<Vec<Warning>> {
    let partial = status == EnvelopeStatus::Partial;
    let items = match obj.get("warnings") {
        None if partial => return Err(missing("warnings")),
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => return Err(wrong_type("warnings", "array", other)),
    };
    if !partial && !items.is_empty() {
        return Err(ValidationFailure::new(
            "warnings",
            format!("must be empty when status is {status}"),
        ));
    }
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| warning(item, &format!("warnings[{idx}]")))
        .collect()
}

fn warning(item: &Value, path: &str) -> Check<Warning> {
    let obj = item
        .as_object()
        .ok_or_else(|| wrong_type(path, "object", item))?;
    let field = |key: &str| required_str(obj, key, &format!("{path}.{key}")).map(str::to_string);
    Ok(Warning {
        kind: field("type")?,
        message: field("message")?,
        impact: field("impact")?,
        recovery: field("recovery")?,
    })
}

fn metadata(obj: &Map<String, Value>) -> Check<Metadata> {
    let meta = match obj.get("metadata") {
        None => return Err(missing("metadata")),
        Some(Value::Object(map)) => map,
        Some(other) => return Err(wrong_type("metadata", "object", other)),
    };
    let path = "metadata.execution_time_ms";
    let execution_time_ms = match meta.get("execution_time_ms") {
        None => return Err(missing(path)),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(ms) => ms,
            None if n.as_i64().is_some() => {
                return Err(ValidationFailure::new(path, "must be non-negative"));
            }
            None => return Err(ValidationFailure::new(path, "must be an integer")),
        },
        Some(other) => return Err(wrong_type(path, "integer", other)),
    };
    let mut extra = meta.clone();
    extra.remove("execution_time_ms");
    Ok(Metadata {
        execution_time_ms,
        extra,
    })
}

fn required_str<'a>(obj: &'a Map<String, Value>, key: &str, path: &str) -> Check<&'a str> {
    match obj.get(key) {
        None => Err(missing(path)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(wrong_type(path, "string", other)),
    }
}

fn missing(path: &str) -> ValidationFailure {
    ValidationFailure::new(path, "required field missing")
}

fn wrong_type(path: &str, expected: &str, found: &Value) -> ValidationFailure {
    ValidationFailure::new(
        path,
        format!("expected {expected}, found {}", type_name(found)),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success() -> Value {
        json!({
            "status": "success",
            "agent": "ticket",
            "version": "1.2",
            "operation": "analyze",
            "result": {"issues": [{"id": 1}]},
            "metadata": {"execution_time_ms": 40, "model": "m"}
        })
    }

    fn error() -> Value {
        json!({
            "status": "error",
            "agent": "design",
            "version": "1",
            "error_type": "access_denied",
            "message": "cannot read repo",
            "recovery_suggestions": ["grant access"],
            "metadata": {"execution_time_ms": 0}
        })
    }

    fn check(value: Value) -> Check<Envelope> {
        EnvelopeValidator::default().validate_value(&value, None)
    }

    fn failure_path(value: Value) -> String {
        check(value).expect_err("should fail").field_path
    }

    #[test]
    fn accepts_success_and_keeps_extra_metadata() {
        let envelope = check(success()).expect("valid");
        assert_eq!(envelope.status, EnvelopeStatus::Success);
        assert_eq!(envelope.operation(), Some("analyze"));
        assert_eq!(envelope.metadata.execution_time_ms, 40);
        assert_eq!(envelope.metadata.extra["model"], json!("m"));
    }

    #[test]
    fn accepts_error_envelope() {
        let envelope = check(error()).expect("valid");
        assert_eq!(envelope.error_kind(), Some(ErrorKind::AccessDenied));
    }

    #[test]
    fn rejects_invalid_json_at_root() {
        let failure = EnvelopeValidator::default()
            .validate("{not json", None)
            .expect_err("should fail");
        assert_eq!(failure.field_path, "$");
        assert!(failure.reason.starts_with("not valid JSON"));
    }

    #[test]
    fn rejects_non_object_document() {
        assert_eq!(failure_path(json!([1, 2])), "$");
    }

    #[test]
    fn rejects_unknown_status() {
        let mut value = success();
        value["status"] = json!("ok");
        assert_eq!(failure_path(value), "status");
    }

    #[test]
    fn rejects_agent_mismatch() {
        let failure = EnvelopeValidator::default()
            .validate_value(&success(), Some("pattern"))
            .expect_err("should fail");
        assert_eq!(failure.field_path, "agent");
        assert!(failure.reason.contains("expected 'pattern'"));
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let mut value = success();
        value["version"] = json!("2.0");
        let failure = check(value).expect_err("should fail");
        assert_eq!(failure.field_path, "version");
        assert!(failure.reason.contains("unsupported major version 2"));
    }

    #[test]
    fn accepts_other_majors_when_configured() {
        let mut value = success();
        value["version"] = json!("2.0.1");
        let validator = EnvelopeValidator::new([1, 2]);
        assert!(validator.validate_value(&value, None).is_ok());
    }

    #[test]
    fn rejects_missing_result_on_success() {
        let mut value = success();
        value.as_object_mut().unwrap().remove("result");
        assert_eq!(failure_path(value), "result");
    }

    #[test]
    fn rejects_error_fields_on_success() {
        let mut value = success();
        value["error_type"] = json!("timeout");
        assert_eq!(failure_path(value), "error_type");
    }

    #[test]
    fn rejects_operation_on_error() {
        let mut value = error();
        value["operation"] = json!("analyze");
        assert_eq!(failure_path(value), "operation");
    }

    #[test]
    fn rejects_empty_recovery_suggestions() {
        let mut value = error();
        value["recovery_suggestions"] = json!([]);
        assert_eq!(failure_path(value), "recovery_suggestions");
    }

    #[test]
    fn partial_requires_warnings_array() {
        let mut value = success();
        value["status"] = json!("partial");
        assert_eq!(failure_path(value.clone()), "warnings");

        value["warnings"] = json!(null);
        let failure = check(value.clone()).expect_err("null warnings");
        assert_eq!(failure.reason, "expected array, found null");

        value["warnings"] = json!([]);
        assert!(check(value).is_ok());
    }

    #[test]
    fn rejects_warnings_outside_partial() {
        let populated = json!([{"type": "x", "message": "m", "impact": "i", "recovery": "r"}]);

        let mut value = success();
        value["warnings"] = populated.clone();
        let failure = check(value.clone()).expect_err("success with warnings");
        assert_eq!(failure.field_path, "warnings");
        assert_eq!(failure.reason, "must be empty when status is success");

        value["warnings"] = json!([]);
        assert!(check(value).is_ok());

        let mut value = error();
        value["warnings"] = populated;
        assert_eq!(failure_path(value), "warnings");
    }

    #[test]
    fn reports_indexed_path_for_bad_warning() {
        let mut value = success();
        value["status"] = json!("partial");
        value["warnings"] = json!([
            {"type": "a", "message": "m", "impact": "i", "recovery": "r"},
            {"type": "b", "message": "m", "impact": 3, "recovery": "r"}
        ]);
        assert_eq!(failure_path(value), "warnings[1].impact");
    }

    #[test]
    fn rejects_stringified_and_negative_execution_time() {
        let mut value = success();
        value["metadata"]["execution_time_ms"] = json!("40");
        assert_eq!(failure_path(value.clone()), "metadata.execution_time_ms");

        value["metadata"]["execution_time_ms"] = json!(-1);
        let failure = check(value.clone()).expect_err("negative");
        assert_eq!(failure.reason, "must be non-negative");

        value["metadata"]["execution_time_ms"] = json!(1.5);
        let failure = check(value).expect_err("float");
        assert_eq!(failure.reason, "must be an integer");
    }

    #[test]
    fn validated_envelope_round_trips_through_wire_shape() {
        let envelope = check(error()).expect("valid");
        let again = check(envelope.to_value()).expect("still valid");
        assert_eq!(again, envelope);
    }
}

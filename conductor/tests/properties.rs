//! Property tests for the pure orchestration core.
//!
//! Covers validator totality, aggregation normal form, the retry attempt
//! bound and the approval-state transition table.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Map, Value, json};

use conductor::core::aggregate::{PhaseReport, aggregate};
use conductor::core::backoff::total_delay;
use conductor::core::envelope::{Envelope, ErrorKind};
use conductor::core::outcome::{FailurePolicy, InvocationOutcome, PhaseResult};
use conductor::core::state::{Decision, Event, WorkflowState, transition};
use conductor::core::validator::EnvelopeValidator;
use conductor::invoke::{InvocationRequest, InvokerSettings, WorkerInvoker};
use conductor::test_support::{ScriptedWorker, Step, error_json, success_json, warning};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(|f| json!(f)),
        "[ -~]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// A valid envelope with one top-level key replaced or removed.
fn arb_mutated_envelope() -> impl Strategy<Value = Value> {
    let keys = prop_oneof![
        Just("status"),
        Just("agent"),
        Just("version"),
        Just("operation"),
        Just("result"),
        Just("warnings"),
        Just("metadata"),
        Just("error_type"),
        Just("error_message"),
    ];
    (keys, prop::option::of(arb_json()), any::<bool>()).prop_map(|(key, replacement, partial)| {
        let raw = if partial {
            conductor::test_support::partial_json("ticket", vec![warning("sparse")])
        } else {
            success_json("ticket")
        };
        let mut value: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
        if let Some(object) = value.as_object_mut() {
            match replacement {
                Some(replacement) => object.insert(key.to_string(), replacement),
                None => object.remove(key),
            };
        }
        value
    })
}

fn arb_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop::sample::select(ErrorKind::ALL.to_vec())
}

fn arb_outcome(worker_id: String) -> impl Strategy<Value = InvocationOutcome> {
    let issues = prop::collection::vec(0u8..10, 0..3);
    let warnings = prop::collection::vec("[a-z]{3,6}", 1..3);
    let (ok_id, partial_id, error_id) = (worker_id.clone(), worker_id.clone(), worker_id);
    prop_oneof![
        issues.prop_map(move |issues| {
            let mut result = Map::new();
            result.insert("issues".into(), json!(issues));
            InvocationOutcome::Envelope(Envelope::success(ok_id.clone(), "analyze", result))
        }),
        warnings.prop_map(move |kinds| {
            let warnings = kinds.iter().map(|k| warning(k)).collect();
            InvocationOutcome::Envelope(Envelope::partial(
                partial_id.clone(),
                "analyze",
                Map::new(),
                warnings,
            ))
        }),
        arb_error_kind().prop_map(move |kind| {
            InvocationOutcome::Envelope(Envelope::error(error_id.clone(), kind, "failed", vec![]))
        }),
        (1u64..600).prop_map(|secs| InvocationOutcome::Timeout {
            after: Duration::from_secs(secs)
        }),
        Just(InvocationOutcome::Skipped),
        Just(InvocationOutcome::Cancelled),
    ]
}

/// Distinct worker ids with outcomes, in a random recording order.
fn arb_recordings() -> impl Strategy<Value = Vec<(String, InvocationOutcome)>> {
    prop::collection::btree_set("[a-f]{1,3}", 0..7)
        .prop_flat_map(|ids| {
            ids.into_iter()
                .map(|id| (Just(id.clone()), arb_outcome(id)))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

fn arb_policy() -> impl Strategy<Value = FailurePolicy> {
    prop_oneof![
        Just(FailurePolicy::FailFast),
        Just(FailurePolicy::ContinueOnError)
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::Start),
        any::<bool>().prop_map(|gated| Event::PhaseSucceeded {
            report: empty_report(),
            gated
        }),
        Just(Event::Decide(Decision::Approve)),
        Just(Event::Decide(Decision::Reject)),
        arb_json().prop_map(|details| Event::Decide(Decision::Modify(details))),
        Just(Event::ExecutionCompleted),
        "[a-z ]{1,12}".prop_map(Event::Fail),
        Just(Event::Cancel),
    ]
}

fn empty_report() -> PhaseReport {
    aggregate(&PhaseResult::new(FailurePolicy::ContinueOnError))
}

fn record_all(policy: FailurePolicy, recordings: &[(String, InvocationOutcome)]) -> PhaseResult {
    let mut result = PhaseResult::new(policy);
    for (id, outcome) in recordings {
        result.record(id.clone(), outcome.clone());
    }
    result
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("paused runtime")
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    /// Arbitrary text never panics the validator; failures always name a reason.
    #[test]
    fn validator_is_total_on_text(raw in ".{0,64}") {
        if let Err(failure) = EnvelopeValidator::default().validate(&raw, None) {
            prop_assert!(!failure.reason.is_empty());
        }
    }

    #[test]
    fn validator_is_total_on_json(value in arb_json()) {
        if let Err(failure) = EnvelopeValidator::default().validate_value(&value, Some("ticket")) {
            prop_assert!(!failure.reason.is_empty());
        }
    }

    /// Near-valid envelopes are either accepted with the right agent or rejected with a reason.
    #[test]
    fn validator_handles_mutated_envelopes(value in arb_mutated_envelope()) {
        match EnvelopeValidator::default().validate_value(&value, Some("ticket")) {
            Ok(envelope) => prop_assert_eq!(envelope.agent, "ticket"),
            Err(failure) => prop_assert!(!failure.reason.is_empty()),
        }
    }

    /// Aggregating a report again changes nothing.
    #[test]
    fn aggregation_is_idempotent(policy in arb_policy(), recordings in arb_recordings()) {
        let report = aggregate(&record_all(policy, &recordings));
        prop_assert_eq!(aggregate(&report), report);
    }

    /// Recording order has no effect on the merged report.
    #[test]
    fn aggregation_ignores_recording_order(policy in arb_policy(), recordings in arb_recordings()) {
        let forward = aggregate(&record_all(policy, &recordings));
        let reversed: Vec<_> = recordings.iter().rev().cloned().collect();
        prop_assert_eq!(aggregate(&record_all(policy, &reversed)), forward);
    }

    /// Every recorded worker lands in exactly one bucket.
    #[test]
    fn aggregation_partitions_workers(policy in arb_policy(), recordings in arb_recordings()) {
        let report = aggregate(&record_all(policy, &recordings));
        let mut seen: Vec<&String> = report
            .succeeded
            .iter()
            .chain(&report.degraded)
            .chain(&report.failed)
            .chain(&report.skipped)
            .chain(&report.cancelled)
            .collect();
        seen.sort();
        let mut expected: Vec<&String> = recordings.iter().map(|(id, _)| id).collect();
        expected.sort();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn total_delay_is_geometric(base_ms in 1u64..1_000, retries in 0u32..16) {
        let base = Duration::from_millis(base_ms);
        let expected = Duration::from_millis(base_ms * ((1u64 << retries) - 1));
        prop_assert_eq!(total_delay(base, retries), expected);
    }

    /// At most `max_retries + 1` attempts, stopping at the first non-transient answer.
    #[test]
    fn retries_are_bounded(
        max_retries in 0u32..5,
        transient_failures in 0usize..8,
        base_ms in 1u64..200,
    ) {
        let worker = ScriptedWorker::new();
        let mut steps: Vec<Step> = (0..transient_failures)
            .map(|_| Step::Respond(error_json("design", ErrorKind::InternalError)))
            .collect();
        steps.push(Step::Respond(success_json("design")));
        worker.script("design", steps);

        let invoker = WorkerInvoker::new(
            Arc::new(worker.clone()),
            EnvelopeValidator::default(),
            InvokerSettings::default(),
        );
        let request = InvocationRequest::new("design", "analyze", json!({}))
            .with_max_retries(max_retries)
            .with_backoff_base(Duration::from_millis(base_ms));

        let invocation = paused_runtime().block_on(invoker.invoke(&request));
        let expected_attempts = (transient_failures as u32).min(max_retries) + 1;
        prop_assert_eq!(invocation.attempts, expected_attempts);
        prop_assert_eq!(worker.calls("design"), expected_attempts as usize);
        prop_assert_eq!(
            invocation.outcome.is_ok(),
            transient_failures as u32 <= max_retries
        );
    }

    /// From a gate, only execution or abort is reachable.
    #[test]
    fn awaiting_approval_reaches_execution_or_abort(event in arb_event()) {
        let phases = vec!["analyze".to_string(), "plan".to_string()];
        let gate = WorkflowState::AwaitingApproval {
            phase: "analyze".into(),
            report: empty_report(),
        };
        match transition(&gate, event, &phases) {
            Ok(WorkflowState::Executing { phase }) => prop_assert_eq!(phase, "analyze"),
            Ok(WorkflowState::Aborted { reason }) => prop_assert!(!reason.is_empty()),
            Ok(other) => prop_assert!(false, "unexpected state {:?}", other),
            Err(err) => prop_assert_eq!(err.state, "awaiting_approval"),
        }
    }

    /// Terminal states accept no event.
    #[test]
    fn terminal_states_reject_every_event(event in arb_event(), reason in "[a-z]{1,8}") {
        let phases = vec!["analyze".to_string()];
        for state in [WorkflowState::Completed, WorkflowState::Aborted { reason: reason.clone() }] {
            prop_assert!(transition(&state, event.clone(), &phases).is_err());
        }
    }
}

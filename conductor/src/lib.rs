//! Orchestration core for contract-speaking workers.
//!
//! Workers are opaque functions that take a request payload and answer with a
//! JSON envelope. This crate validates those envelopes, invokes workers with
//! timeout and retry, composes invocations into phases, aggregates phase
//! results and drives approval-gated workflows. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (validation, outcome rules,
//!   aggregation, the workflow transition table). No I/O.
//! - **[`io`]**: Side-effecting operations (config and workflow files, worker
//!   processes). Isolated behind traits to enable scripted workers in tests.
//!
//! Orchestration modules ([`invoke`], [`schedule`], [`workflow`]) combine the
//! two on the tokio runtime.

pub mod core;
pub mod exit_codes;
pub mod invoke;
pub mod io;
pub mod logging;
pub mod schedule;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;

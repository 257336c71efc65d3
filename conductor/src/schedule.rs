//! Composition of worker invocations into phases.
//!
//! A [`ScheduleNode`] tree is evaluated by [`Scheduler::run`] into a
//! [`PhaseResult`]. Leaves share one bounded permit pool, so a wide parallel
//! node never runs more than `pool_size` workers at once.
//!
//! Stopping (fail-fast or cancellation) is cooperative: leaves that have not
//! started are recorded as skipped, leaves in flight as cancelled, and leaves
//! that finish first keep their outcome.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::FuturesUnordered;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::outcome::{FailurePolicy, InvocationOutcome, PhaseResult};
use crate::core::predicate::Predicate;
use crate::invoke::{InvocationRequest, WorkerInvoker};

/// Default number of concurrently running leaves.
pub const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleNode {
    Parallel(Vec<ScheduleNode>),
    Sequential(Vec<ScheduleNode>),
    /// Runs `then` when `when` holds against the outcomes so far, else `otherwise`.
    Conditional {
        when: Predicate,
        then: Box<ScheduleNode>,
        otherwise: Option<Box<ScheduleNode>>,
    },
    Leaf(InvocationRequest),
}

impl ScheduleNode {
    pub fn leaf(request: InvocationRequest) -> Self {
        ScheduleNode::Leaf(request)
    }

    /// Worker ids of every leaf, in tree order.
    pub fn leaf_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids<'a>(&'a self, ids: &mut Vec<&'a str>) {
        match self {
            ScheduleNode::Parallel(children) | ScheduleNode::Sequential(children) => {
                for child in children {
                    child.collect_ids(ids);
                }
            }
            ScheduleNode::Conditional {
                then, otherwise, ..
            } => {
                then.collect_ids(ids);
                if let Some(otherwise) = otherwise {
                    otherwise.collect_ids(ids);
                }
            }
            ScheduleNode::Leaf(request) => ids.push(&request.worker_id),
        }
    }

    /// Outcomes are keyed by worker id, so a tree may name each worker once.
    pub fn check_unique_leaves(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for id in self.leaf_ids() {
            if !seen.insert(id) {
                bail!("worker '{id}' appears more than once in one schedule");
            }
        }
        Ok(())
    }

    /// Apply `f` to every leaf request.
    pub fn for_each_request_mut(&mut self, f: &mut dyn FnMut(&mut InvocationRequest)) {
        match self {
            ScheduleNode::Parallel(children) | ScheduleNode::Sequential(children) => {
                for child in children {
                    child.for_each_request_mut(f);
                }
            }
            ScheduleNode::Conditional {
                then, otherwise, ..
            } => {
                then.for_each_request_mut(f);
                if let Some(otherwise) = otherwise {
                    otherwise.for_each_request_mut(f);
                }
            }
            ScheduleNode::Leaf(request) => f(request),
        }
    }
}

/// Shared state of one [`Scheduler::run`] call.
struct RunContext {
    policy: FailurePolicy,
    /// Tripped by fail-fast or by the caller's token.
    stop: CancellationToken,
    result: Mutex<PhaseResult>,
}

impl RunContext {
    async fn record(&self, worker_id: &str, outcome: InvocationOutcome) {
        let failed = outcome.is_failure();
        debug!(worker = worker_id, outcome = outcome.label(), "leaf finished");
        self.result.lock().await.record(worker_id, outcome);
        if failed && self.policy == FailurePolicy::FailFast && !self.stop.is_cancelled() {
            info!(worker = worker_id, "fail-fast: stopping remaining work");
            self.stop.cancel();
        }
    }

    async fn skip(&self, node: &ScheduleNode) {
        let mut result = self.result.lock().await;
        for id in node.leaf_ids() {
            result.record(id, InvocationOutcome::Skipped);
        }
    }
}

/// Evaluates schedule trees. Holds no per-run state.
#[derive(Clone)]
pub struct Scheduler {
    invoker: Arc<WorkerInvoker>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(invoker: WorkerInvoker, pool_size: usize) -> Self {
        Self {
            invoker: Arc::new(invoker),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Evaluate `node` under `policy`.
    ///
    /// Errors only for structurally invalid trees; worker failures are data
    /// in the returned [`PhaseResult`].
    #[instrument(skip_all, fields(policy = %policy))]
    pub async fn run(
        &self,
        node: &ScheduleNode,
        policy: FailurePolicy,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult> {
        node.check_unique_leaves()?;
        let ctx = RunContext {
            policy,
            stop: cancel.child_token(),
            result: Mutex::new(PhaseResult::new(policy)),
        };
        self.eval(node, &ctx).await;

        let mut result = ctx.result.into_inner();
        if cancel.is_cancelled() {
            result.mark_cancelled();
        }
        debug!(status = %result.status(), "schedule finished");
        Ok(result)
    }

    fn eval<'a>(&'a self, node: &'a ScheduleNode, ctx: &'a RunContext) -> BoxFuture<'a, ()> {
        async move {
            if ctx.stop.is_cancelled() {
                ctx.skip(node).await;
                return;
            }
            match node {
                ScheduleNode::Leaf(request) => self.run_leaf(request, ctx).await,
                ScheduleNode::Sequential(children) => {
                    for child in children {
                        self.eval(child, ctx).await;
                    }
                }
                ScheduleNode::Parallel(children) => {
                    let mut pending = children
                        .iter()
                        .map(|child| self.eval(child, ctx))
                        .collect::<FuturesUnordered<_>>();
                    while pending.next().await.is_some() {}
                }
                ScheduleNode::Conditional {
                    when,
                    then,
                    otherwise,
                } => {
                    let holds = when.evaluate(&*ctx.result.lock().await);
                    debug!(holds, "conditional evaluated");
                    let (taken, untaken) = if holds {
                        (Some(then.as_ref()), otherwise.as_deref())
                    } else {
                        (otherwise.as_deref(), Some(then.as_ref()))
                    };
                    if let Some(untaken) = untaken {
                        ctx.skip(untaken).await;
                    }
                    if let Some(taken) = taken {
                        self.eval(taken, ctx).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn run_leaf(&self, request: &InvocationRequest, ctx: &RunContext) {
        let permit = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            ctx.result
                .lock()
                .await
                .record(&request.worker_id, InvocationOutcome::Skipped);
            return;
        };
        if ctx.stop.is_cancelled() {
            ctx.result
                .lock()
                .await
                .record(&request.worker_id, InvocationOutcome::Skipped);
            return;
        }

        let outcome = tokio::select! {
            biased;
            invocation = self.invoker.invoke(request) => invocation.outcome,
            _ = ctx.stop.cancelled() => InvocationOutcome::Cancelled,
        };
        ctx.record(&request.worker_id, outcome).await;
    }
}

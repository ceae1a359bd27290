//! Flow executor.
//!
//! Recursively interprets a plan's flow tree against a [`RunContext`].
//! Sequential and loop nodes honor pause and cancel between children;
//! parallel children are spawned as separate units on the shared worker
//! pool; leaf steps go through the approval gate (when required) and then
//! the registered [`StepInvoker`](crate::invoker::StepInvoker).

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalGate, ApprovalStatus};
use crate::condition::Predicate;
use crate::invoker::{InvocationContext, InvokerRegistry, StepRequest};
use crate::plan::{FlowNode, StepSpec};
use crate::run::RunContext;
use crate::store::PlanStore;
use crate::template::resolve_params;

/// Reason code carried by a failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The invoker returned an error or an unsuccessful result.
    StepFailed,
    /// The invoker did not answer within the step timeout.
    StepTimedOut,
    ApprovalDenied,
    ApprovalTimedOut,
    /// No invoker is registered for the step's capability.
    UnknownCapability,
    /// Parameter templates could not be resolved.
    InvalidParams,
    /// Engine-side fault (a panicked unit, an errored approval).
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::StepFailed => "step_failed",
            FailureKind::StepTimedOut => "step_timed_out",
            FailureKind::ApprovalDenied => "approval_denied",
            FailureKind::ApprovalTimedOut => "approval_timed_out",
            FailureKind::UnknownCapability => "unknown_capability",
            FailureKind::InvalidParams => "invalid_params",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failing step and why it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(step_id: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' {}: {}", self.step_id, self.kind, self.message)
    }
}

/// Result of executing a flow node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(StepFailure),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    fn failure(step: &StepSpec, kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure(StepFailure::new(step.id.clone(), kind, message))
    }
}

/// Interprets flow trees.
///
/// Cheap to clone; every clone shares the invoker registry, approval gate,
/// plan store, and worker pool.
#[derive(Clone)]
pub struct FlowExecutor {
    invokers: Arc<InvokerRegistry>,
    gate: Arc<ApprovalGate>,
    store: Arc<dyn PlanStore>,
    pool: Arc<Semaphore>,
    default_step_timeout: Duration,
}

impl FlowExecutor {
    pub fn new(
        invokers: Arc<InvokerRegistry>,
        gate: Arc<ApprovalGate>,
        store: Arc<dyn PlanStore>,
        pool: Arc<Semaphore>,
        default_step_timeout: Duration,
    ) -> Self {
        Self {
            invokers,
            gate,
            store,
            pool,
            default_step_timeout,
        }
    }

    /// Take a worker pool slot, or `None` if the run is cancelled first.
    pub async fn acquire_slot(&self, run: &RunContext) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = run.cancelled() => None,
            permit = self.pool.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Execute a node as an isolated unit.
    ///
    /// A panic anywhere below `node` becomes an `Internal` failure carrying
    /// the step that was running when it happened.
    pub async fn execute_unit(&self, node: &FlowNode, run: &Arc<RunContext>) -> Outcome {
        match AssertUnwindSafe(self.execute(node, run)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let step_id = panicked_step(node, run);
                run.step_finished(&step_id);
                let message = panic_message(panic.as_ref());
                error!(plan_id = %run.plan_id(), step_id = %step_id, panic = %message, "Execution unit panicked");
                Outcome::Failure(StepFailure::new(
                    step_id,
                    FailureKind::Internal,
                    format!("step panicked: {}", message),
                ))
            }
        }
    }

    /// Execute a node and everything below it.
    pub fn execute<'a>(&'a self, node: &'a FlowNode, run: &'a Arc<RunContext>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            if run.is_cancelled() {
                return Outcome::Cancelled;
            }
            match node {
                FlowNode::Sequential { children } => self.execute_sequential(children, run).await,
                FlowNode::Parallel {
                    children,
                    wait_for_all,
                } => self.execute_parallel(children, *wait_for_all, run).await,
                FlowNode::Conditional {
                    predicate,
                    then_branch,
                    else_branch,
                } => {
                    let holds = run.evaluate(predicate);
                    debug!(plan_id = %run.plan_id(), predicate = %predicate, holds, "Conditional evaluated");
                    match (holds, else_branch) {
                        (true, _) => self.execute(then_branch, run).await,
                        (false, Some(else_branch)) => self.execute(else_branch, run).await,
                        (false, None) => Outcome::Success,
                    }
                }
                FlowNode::Loop {
                    body,
                    exit_condition,
                    max_iterations,
                    iteration_key,
                } => {
                    self.execute_loop(body, exit_condition, *max_iterations, iteration_key.as_deref(), run)
                        .await
                }
                FlowNode::SubFlow { flow } => self.execute(flow, run).await,
                FlowNode::Step(step) => self.execute_step(step, run).await,
            }
        })
    }

    // ---------------------------------------------------------------------------
    // Composite nodes
    // ---------------------------------------------------------------------------

    async fn execute_sequential(&self, children: &[FlowNode], run: &Arc<RunContext>) -> Outcome {
        for child in children {
            if !run.checkpoint().await {
                return Outcome::Cancelled;
            }
            let outcome = self.execute(child, run).await;
            if !outcome.is_success() {
                return outcome;
            }
        }
        Outcome::Success
    }

    async fn execute_parallel(
        &self,
        children: &[FlowNode],
        wait_for_all: bool,
        run: &Arc<RunContext>,
    ) -> Outcome {
        if children.is_empty() {
            return Outcome::Success;
        }
        debug!(plan_id = %run.plan_id(), children = children.len(), wait_for_all, "Dispatching parallel children");

        let handles: Vec<_> = children
            .iter()
            .map(|child| {
                let executor = self.clone();
                let child = child.clone();
                let run = run.clone();
                tokio::spawn(async move {
                    let Some(_slot) = executor.acquire_slot(&run).await else {
                        return Outcome::Cancelled;
                    };
                    executor.execute_unit(&child, &run).await
                })
            })
            .collect();

        if wait_for_all {
            let joined = tokio::select! {
                _ = run.cancelled() => return Outcome::Cancelled,
                joined = future::join_all(handles) => joined,
            };

            let outcomes: Vec<Outcome> = joined
                .into_iter()
                .zip(children)
                .map(|(joined, child)| join_outcome(joined, child))
                .collect();
            if run.is_cancelled() {
                return Outcome::Cancelled;
            }
            // First failure in child order wins
            if let Some(failure) = outcomes.iter().find(|o| matches!(o, Outcome::Failure(_))) {
                return failure.clone();
            }
            if outcomes.iter().any(|o| matches!(o, Outcome::Cancelled)) {
                return Outcome::Cancelled;
            }
            Outcome::Success
        } else {
            // Remaining handles are dropped, which detaches their tasks. They
            // keep running and writing shared state until they finish or the
            // run token fires.
            let (first, index) = tokio::select! {
                _ = run.cancelled() => return Outcome::Cancelled,
                (first, index, _rest) = future::select_all(handles) => {
                    debug!(plan_id = %run.plan_id(), index, "First parallel child resolved");
                    (first, index)
                }
            };
            join_outcome(first, &children[index])
        }
    }

    async fn execute_loop(
        &self,
        body: &FlowNode,
        exit_condition: &Predicate,
        max_iterations: u32,
        iteration_key: Option<&str>,
        run: &Arc<RunContext>,
    ) -> Outcome {
        for iteration in 0..max_iterations {
            if !run.checkpoint().await {
                return Outcome::Cancelled;
            }
            if let Some(key) = iteration_key {
                run.set_value(key, json!(iteration));
            }

            let outcome = self.execute(body, run).await;
            if !outcome.is_success() {
                return outcome;
            }

            if run.evaluate(exit_condition) {
                debug!(plan_id = %run.plan_id(), iteration, "Loop exit condition met");
                return Outcome::Success;
            }
        }

        warn!(
            plan_id = %run.plan_id(),
            max_iterations,
            condition = %exit_condition,
            "Loop reached max iterations without meeting exit condition"
        );
        Outcome::Success
    }

    // ---------------------------------------------------------------------------
    // Steps
    // ---------------------------------------------------------------------------

    async fn execute_step(&self, step: &StepSpec, run: &Arc<RunContext>) -> Outcome {
        run.step_started(&step.id);
        let outcome = self.run_step(step, run).await;
        run.step_finished(&step.id);

        match &outcome {
            Outcome::Success => {
                if run.record_completion(&step.id) {
                    self.persist_completion(run, &step.id).await;
                }
            }
            Outcome::Failure(failure) => {
                error!(
                    plan_id = %run.plan_id(),
                    step_id = %step.id,
                    kind = %failure.kind,
                    message = %failure.message,
                    "Step failed"
                );
            }
            Outcome::Cancelled => {
                debug!(plan_id = %run.plan_id(), step_id = %step.id, "Step cancelled");
            }
        }
        outcome
    }

    async fn run_step(&self, step: &StepSpec, run: &Arc<RunContext>) -> Outcome {
        if step.requires_approval {
            let outcome = self.await_approval(step, run).await;
            if !outcome.is_success() {
                return outcome;
            }
            // A pause requested during the approval holds the invocation
            if !run.checkpoint().await {
                return Outcome::Cancelled;
            }
        }

        let Some(invoker) = self.invokers.get(&step.capability) else {
            return Outcome::failure(
                step,
                FailureKind::UnknownCapability,
                format!("no invoker registered for capability '{}'", step.capability),
            );
        };

        let shared_state = run.snapshot();
        let params = match resolve_params(&step.params, &shared_state) {
            Ok(params) => params,
            Err(e) => return Outcome::failure(step, FailureKind::InvalidParams, e.to_string()),
        };

        let request = StepRequest {
            plan_id: run.plan_id().to_string(),
            step_id: step.id.clone(),
            capability: step.capability.clone(),
            params,
            shared_state,
        };
        let timeout = step.timeout().unwrap_or(self.default_step_timeout);
        let ctx = InvocationContext {
            plan_id: run.plan_id().to_string(),
            timeout,
            cancellation: run.cancellation().clone(),
        };

        debug!(
            plan_id = %run.plan_id(),
            step_id = %step.id,
            capability = %step.capability,
            timeout_ms = timeout.as_millis() as u64,
            "Invoking step"
        );

        let result = tokio::select! {
            biased;
            _ = run.cancelled() => return Outcome::Cancelled,
            result = tokio::time::timeout(timeout, invoker.invoke(&request, &ctx)) => result,
        };

        match result {
            Err(_) => Outcome::failure(
                step,
                FailureKind::StepTimedOut,
                format!("no result within {}s", timeout.as_secs_f64()),
            ),
            Ok(Err(e)) => Outcome::failure(step, FailureKind::StepFailed, e.to_string()),
            Ok(Ok(result)) if !result.success => Outcome::failure(
                step,
                FailureKind::StepFailed,
                result
                    .error
                    .unwrap_or_else(|| "step reported failure".to_string()),
            ),
            Ok(Ok(result)) => {
                run.apply_output(step.output_key.as_deref(), result.output);
                debug!(plan_id = %run.plan_id(), step_id = %step.id, "Step succeeded");
                Outcome::Success
            }
        }
    }

    async fn await_approval(&self, step: &StepSpec, run: &Arc<RunContext>) -> Outcome {
        let description = if step.description.is_empty() {
            format!("Approve step '{}' ({})", step.display_name(), step.capability)
        } else {
            step.description.clone()
        };
        let context = json!({
            "step_name": step.display_name(),
            "capability": step.capability,
            "params": step.params,
        });

        run.approval_started();
        let status = self
            .gate
            .request_approval(run.plan_id(), &step.id, &description, context, run.cancellation())
            .await;
        run.approval_finished();

        match status {
            ApprovalStatus::Approved => Outcome::Success,
            ApprovalStatus::Denied => {
                Outcome::failure(step, FailureKind::ApprovalDenied, "approval denied")
            }
            ApprovalStatus::TimedOut => Outcome::failure(
                step,
                FailureKind::ApprovalTimedOut,
                format!("no decision within {}s", self.gate.timeout().as_secs()),
            ),
            ApprovalStatus::Errored | ApprovalStatus::Pending => {
                if run.is_cancelled() {
                    Outcome::Cancelled
                } else {
                    Outcome::failure(step, FailureKind::Internal, "approval request errored")
                }
            }
        }
    }

    async fn persist_completion(&self, run: &RunContext, step_id: &str) {
        if let Err(e) = self.store.save_step_completion(run.plan_id(), step_id).await {
            warn!(plan_id = %run.plan_id(), step_id, error = %e, "Failed to persist step completion");
            run.mark_degraded();
        } else {
            info!(
                plan_id = %run.plan_id(),
                step_id,
                completed = run.completed_steps(),
                total = run.total_steps(),
                "Step completed"
            );
        }
    }
}

fn join_outcome(joined: Result<Outcome, tokio::task::JoinError>, child: &FlowNode) -> Outcome {
    joined.unwrap_or_else(|e| {
        let mut first_step = None;
        child.for_each_step(&mut |step| {
            first_step.get_or_insert(step.id.as_str());
        });
        Outcome::Failure(StepFailure::new(
            first_step.unwrap_or_default(),
            FailureKind::Internal,
            format!("parallel unit aborted: {}", e),
        ))
    })
}

/// The most recently started step under `node` that never finished, falling
/// back to the first step of `node`.
fn panicked_step(node: &FlowNode, run: &RunContext) -> String {
    let mut ids = Vec::new();
    node.for_each_step(&mut |step| ids.push(step.id.as_str()));
    run.status()
        .active_steps
        .into_iter()
        .rev()
        .find(|active| ids.contains(&active.as_str()))
        .or_else(|| ids.first().map(|id| id.to_string()))
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{InvokeError, StepResult};
    use crate::store::InMemoryPlanStore;
    use serde_json::Value;

    fn executor(registry: InvokerRegistry) -> (FlowExecutor, Arc<InMemoryPlanStore>) {
        let store = Arc::new(InMemoryPlanStore::new());
        let executor = FlowExecutor::new(
            Arc::new(registry),
            Arc::new(ApprovalGate::default()),
            store.clone(),
            Arc::new(Semaphore::new(4)),
            Duration::from_secs(5),
        );
        (executor, store)
    }

    fn echo_registry() -> InvokerRegistry {
        let mut registry = InvokerRegistry::new();
        registry.register_fn("echo", |req: StepRequest, _ctx| async move {
            Ok(StepResult::with_output(
                req.params.as_object().cloned().unwrap_or_default(),
            ))
        });
        registry.register_fn("fail", |_req, _ctx| async move {
            Err(InvokeError::Failed("boom".into()))
        });
        registry.register_fn("soft_fail", |_req, _ctx| async move {
            Ok(StepResult::failed("not today"))
        });
        registry
    }

    fn run(total: usize) -> Arc<RunContext> {
        let run = Arc::new(RunContext::new("p", total));
        run.mark_running();
        run
    }

    fn step(id: &str, capability: &str) -> StepSpec {
        StepSpec::new(id, capability)
    }

    #[tokio::test]
    async fn test_step_output_merges_into_state() {
        let (executor, store) = executor(echo_registry());
        let run = run(1);
        let node = FlowNode::step(step("a", "echo").with_params(json!({"greeting": "hi"})));

        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.get_value("greeting"), Some(json!("hi")));
        assert_eq!(run.completed_steps(), 1);
        assert_eq!(store.completed_steps("p"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_output_key_and_templates() {
        let (executor, _store) = executor(echo_registry());
        let run = run(2);
        let node = FlowNode::sequential(vec![
            FlowNode::step(
                step("first", "echo")
                    .with_params(json!({"value": 21}))
                    .with_output_key("first"),
            ),
            FlowNode::step(
                step("second", "echo")
                    .with_params(json!({"doubled_from": "{{first.value}}", "note": "got {{first.value}}"})),
            ),
        ]);

        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.get_value("first"), Some(json!({"value": 21})));
        assert_eq!(run.get_value("doubled_from"), Some(json!(21)));
        assert_eq!(run.get_value("note"), Some(json!("got 21")));
    }

    #[tokio::test]
    async fn test_unresolvable_template_is_invalid_params() {
        let (executor, _store) = executor(echo_registry());
        let run = run(1);
        let node = FlowNode::step(step("a", "echo").with_params(json!({"x": "{{missing.key}}"})));

        let Outcome::Failure(failure) = executor.execute(&node, &run).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::InvalidParams);
        assert_eq!(failure.step_id, "a");
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let (executor, _store) = executor(echo_registry());
        let run = run(1);
        let node = FlowNode::step(step("a", "teleport"));

        let Outcome::Failure(failure) = executor.execute(&node, &run).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::UnknownCapability);
        assert!(failure.message.contains("teleport"));
        assert_eq!(run.completed_steps(), 0);
    }

    #[tokio::test]
    async fn test_invoke_error_and_soft_failure() {
        let (executor, _store) = executor(echo_registry());
        let run = run(2);

        let Outcome::Failure(hard) = executor.execute(&FlowNode::step(step("a", "fail")), &run).await
        else {
            panic!("expected failure");
        };
        assert_eq!(hard.kind, FailureKind::StepFailed);
        assert!(hard.message.contains("boom"));

        let Outcome::Failure(soft) = executor
            .execute(&FlowNode::step(step("b", "soft_fail")), &run)
            .await
        else {
            panic!("expected failure");
        };
        assert_eq!(soft.message, "not today");
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let mut registry = InvokerRegistry::new();
        registry.register_fn("slow", |_req, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StepResult::ok())
        });
        let (executor, _store) = executor(registry);
        let run = run(1);
        let node = FlowNode::step(step("a", "slow").with_timeout_secs(2));

        let Outcome::Failure(failure) = executor.execute(&node, &run).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::StepTimedOut);
    }

    #[tokio::test]
    async fn test_conditional_branches() {
        let (executor, _store) = executor(echo_registry());
        let run = run(2);
        let node = FlowNode::Conditional {
            predicate: Predicate::parse("mode == 'fast'").unwrap(),
            then_branch: Box::new(FlowNode::step(step("fast", "echo").with_params(json!({"took": "fast"})))),
            else_branch: Some(Box::new(FlowNode::step(
                step("slow", "echo").with_params(json!({"took": "slow"})),
            ))),
        };

        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.get_value("took"), Some(json!("slow")));

        run.set_value("mode", json!("fast"));
        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.get_value("took"), Some(json!("fast")));
    }

    #[tokio::test]
    async fn test_conditional_without_else_is_noop() {
        let (executor, _store) = executor(echo_registry());
        let run = run(1);
        let node = FlowNode::Conditional {
            predicate: Predicate::parse("never").unwrap(),
            then_branch: Box::new(FlowNode::step(step("a", "fail"))),
            else_branch: None,
        };
        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.completed_steps(), 0);
    }

    #[tokio::test]
    async fn test_loop_exits_on_condition_with_iteration_key() {
        let mut registry = InvokerRegistry::new();
        registry.register_fn("count", |req: StepRequest, _ctx| async move {
            let n = req
                .shared_state
                .get("n")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(StepResult::ok().insert("n", json!(n + 1)))
        });
        let (executor, _store) = executor(registry);
        let run = run(1);
        let node = FlowNode::Loop {
            body: Box::new(FlowNode::step(step("inc", "count"))),
            exit_condition: Predicate::parse("n >= 2").unwrap(),
            max_iterations: 10,
            iteration_key: Some("i".into()),
        };

        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.get_value("n"), Some(json!(2)));
        assert_eq!(run.get_value("i"), Some(json!(1)));
        // Re-running the same step does not inflate the counter
        assert_eq!(run.completed_steps(), 1);
    }

    #[tokio::test]
    async fn test_loop_failure_stops_iterations() {
        let (executor, _store) = executor(echo_registry());
        let run = run(1);
        let node = FlowNode::Loop {
            body: Box::new(FlowNode::step(step("a", "fail"))),
            exit_condition: Predicate::parse("done").unwrap(),
            max_iterations: 5,
            iteration_key: Some("i".into()),
        };
        assert!(matches!(executor.execute(&node, &run).await, Outcome::Failure(_)));
        assert_eq!(run.get_value("i"), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_subflow_is_transparent() {
        let (executor, _store) = executor(echo_registry());
        let run = run(1);
        let node = FlowNode::SubFlow {
            flow: Box::new(FlowNode::step(step("a", "echo").with_params(json!({"k": 1})))),
        };
        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert_eq!(run.get_value("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_parallel_wait_for_all_reports_first_failure_in_order() {
        let (executor, _store) = executor(echo_registry());
        let run = run(3);
        let node = FlowNode::parallel(
            vec![
                FlowNode::step(step("ok", "echo")),
                FlowNode::step(step("bad1", "fail")),
                FlowNode::step(step("bad2", "soft_fail")),
            ],
            true,
        );

        let Outcome::Failure(failure) = executor.execute(&node, &run).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.step_id, "bad1");
        // The successful sibling still ran to completion
        assert_eq!(run.completed_steps(), 1);
    }

    async fn explode(req: StepRequest, _ctx: InvocationContext) -> Result<StepResult, InvokeError> {
        panic!("invoker exploded in {}", req.step_id)
    }

    fn exploding_registry() -> InvokerRegistry {
        let mut registry = echo_registry();
        registry.register_fn("explode", explode);
        registry
    }

    #[tokio::test]
    async fn test_panicking_step_becomes_internal_failure() {
        let (executor, _store) = executor(exploding_registry());
        let run = run(3);
        let node = FlowNode::sequential(vec![
            FlowNode::step(step("a", "echo")),
            FlowNode::step(step("b", "explode")),
            FlowNode::step(step("c", "echo")),
        ]);

        let Outcome::Failure(failure) = executor.execute_unit(&node, &run).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Internal);
        assert_eq!(failure.step_id, "b");
        assert!(failure.message.contains("invoker exploded in b"));
        assert_eq!(run.completed_steps(), 1);
        assert!(run.status().active_steps.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_child_panic_names_its_step() {
        let (executor, _store) = executor(exploding_registry());
        let run = run(2);
        let node = FlowNode::parallel(
            vec![
                FlowNode::step(step("calm", "echo")),
                FlowNode::sequential(vec![FlowNode::step(step("loud", "explode"))]),
            ],
            true,
        );

        let Outcome::Failure(failure) = executor.execute(&node, &run).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Internal);
        assert_eq!(failure.step_id, "loud");
    }

    #[tokio::test]
    async fn test_aborted_parallel_unit_names_first_step() {
        let handle = tokio::spawn(std::future::pending::<Outcome>());
        handle.abort();
        let child = FlowNode::sequential(vec![
            FlowNode::step(step("first", "echo")),
            FlowNode::step(step("second", "echo")),
        ]);

        let Outcome::Failure(failure) = join_outcome(handle.await, &child) else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Internal);
        assert_eq!(failure.step_id, "first");
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let (executor, _store) = executor(echo_registry());
        let run = run(1);
        run.cancel();
        let node = FlowNode::sequential(vec![FlowNode::step(step("a", "echo"))]);
        assert_eq!(executor.execute(&node, &run).await, Outcome::Cancelled);
        assert_eq!(run.completed_steps(), 0);
    }

    #[tokio::test]
    async fn test_approval_denied_fails_step() {
        let (executor, _store) = executor(echo_registry());
        let gate = executor.gate.clone();
        let run = run(1);
        let node = FlowNode::step(step("deploy", "echo").with_approval());

        let task = {
            let executor = executor.clone();
            let run = run.clone();
            tokio::spawn(async move { executor.execute(&node, &run).await })
        };
        while gate.get("p", "deploy").is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(run.state(), crate::run::RunState::WaitingForApproval);
        assert!(gate.decide("p", "deploy", false));

        let Outcome::Failure(failure) = task.await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::ApprovalDenied);
        assert_eq!(run.state(), crate::run::RunState::Running);
    }

    #[tokio::test]
    async fn test_degraded_when_store_unavailable() {
        let (executor, store) = executor(echo_registry());
        store.set_unavailable(true);
        let run = run(1);
        let node = FlowNode::step(step("a", "echo"));

        assert_eq!(executor.execute(&node, &run).await, Outcome::Success);
        assert!(run.is_degraded());
        assert_eq!(run.completed_steps(), 1);
    }

    #[test]
    fn test_failure_display() {
        let failure = StepFailure::new("a", FailureKind::StepTimedOut, "no result within 2s");
        assert_eq!(failure.to_string(), "step 'a' step_timed_out: no result within 2s");
    }
}

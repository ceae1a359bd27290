//! Execution coordinator.
//!
//! Owns the lifecycle of plan runs: start, pause, resume, cancel, and status.
//! All runs share one bounded worker pool; a run's top-level flow and each
//! of its parallel children hold a pool slot while they execute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nebula_config::EngineSection;
use parking_lot::RwLock;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalGate;
use crate::error::{EngineError, Result};
use crate::executor::{FlowExecutor, Outcome};
use crate::invoker::InvokerRegistry;
use crate::plan::ExecutionPlan;
use crate::run::{RunContext, RunState, RunStatus, SharedState};
use crate::store::{PlanStore, StoreError};

/// Configuration for the execution coordinator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size shared by all runs.
    pub worker_pool_size: usize,

    /// How long an approval ticket waits for a decision.
    pub approval_timeout: Duration,

    /// Step timeout when a step declares none.
    pub default_step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            worker_pool_size: section.worker_pool_size.max(1),
            approval_timeout: Duration::from_secs(section.approval_timeout_secs),
            default_step_timeout: Duration::from_secs(section.default_step_timeout_secs),
        }
    }
}

/// Final result of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Status snapshot taken after the terminal state was persisted.
    pub status: RunStatus,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status.state == RunState::Completed
    }
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    plan_id: String,
    run: Arc<RunContext>,
    done: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Live status snapshot. Still answers after the run was evicted.
    pub fn status(&self) -> RunStatus {
        self.run.status()
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RunReport> {
        self.done
            .await
            .map_err(|_| EngineError::Internal(format!("run '{}' ended without a report", self.plan_id)))
    }
}

type ActiveRuns = Arc<RwLock<HashMap<String, Arc<RunContext>>>>;

/// Multiplexes plan runs over a bounded worker pool.
pub struct ExecutionCoordinator {
    config: EngineConfig,
    store: Arc<dyn PlanStore>,
    gate: Arc<ApprovalGate>,
    pool: Arc<Semaphore>,
    executor: FlowExecutor,
    /// Active runs by plan id.
    runs: ActiveRuns,
}

impl ExecutionCoordinator {
    /// Create a coordinator.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool size and timeouts
    /// * `store` - Where plans are read from and progress is written to
    /// * `invokers` - Capability → invoker table
    pub fn new(config: EngineConfig, store: Arc<dyn PlanStore>, invokers: InvokerRegistry) -> Self {
        let gate = Arc::new(ApprovalGate::new(config.approval_timeout));
        let pool = Arc::new(Semaphore::new(config.worker_pool_size));
        let executor = FlowExecutor::new(
            Arc::new(invokers),
            gate.clone(),
            store.clone(),
            pool.clone(),
            config.default_step_timeout,
        );

        info!(
            worker_pool_size = config.worker_pool_size,
            approval_timeout_secs = config.approval_timeout.as_secs(),
            "Execution coordinator initialized"
        );

        Self {
            config,
            store,
            gate,
            pool,
            executor,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The approval gate shared by all runs. Decisions go through
    /// [`ApprovalGate::decide`].
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Pool slots not currently held by any run.
    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// Start a run of the given plan.
    ///
    /// Fails with `AlreadyRunning` if the plan has an active run,
    /// `PlanNotFound` if the store does not know it, and `InvalidPlan` if the
    /// flow tree is malformed.
    pub async fn start(&self, plan_id: &str) -> Result<RunHandle> {
        self.start_with_state(plan_id, SharedState::new()).await
    }

    /// Start a run with pre-seeded shared state.
    pub async fn start_with_state(&self, plan_id: &str, initial: SharedState) -> Result<RunHandle> {
        if self.runs.read().contains_key(plan_id) {
            return Err(EngineError::AlreadyRunning(plan_id.to_string()));
        }

        let plan = self.store.load_plan(plan_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::PlanNotFound(plan_id.to_string()),
            other => EngineError::Store(other),
        })?;
        if plan.plan_id != plan_id {
            return Err(EngineError::InvalidPlan(format!(
                "store returned plan '{}' for id '{}'",
                plan.plan_id, plan_id
            )));
        }
        plan.validate()?;

        let run = Arc::new(RunContext::new(plan_id, plan.step_count()).with_initial_state(initial));
        {
            let mut runs = self.runs.write();
            if runs.contains_key(plan_id) {
                return Err(EngineError::AlreadyRunning(plan_id.to_string()));
            }
            runs.insert(plan_id.to_string(), run.clone());
        }

        info!(plan_id, total_steps = run.total_steps(), "Run accepted");

        let (tx, rx) = oneshot::channel();
        let driver = RunDriver {
            plan,
            run: run.clone(),
            executor: self.executor.clone(),
            store: self.store.clone(),
            runs: self.runs.clone(),
        };
        tokio::spawn(driver.drive(tx));

        Ok(RunHandle {
            plan_id: plan_id.to_string(),
            run,
            done: rx,
        })
    }

    /// Pause a run before its next node. In-flight steps are not interrupted.
    pub fn pause(&self, plan_id: &str) -> bool {
        let Some(run) = self.active(plan_id) else {
            return false;
        };
        let paused = run.pause();
        if paused {
            info!(plan_id, "Run paused");
        }
        paused
    }

    /// Resume a paused run.
    pub fn resume(&self, plan_id: &str) -> bool {
        let Some(run) = self.active(plan_id) else {
            return false;
        };
        let resumed = run.resume();
        if resumed {
            info!(plan_id, state = %run.state(), "Run resumed");
        }
        resumed
    }

    /// Cancel a run and signal its cancellation token.
    pub fn cancel(&self, plan_id: &str) -> bool {
        let Some(run) = self.active(plan_id) else {
            return false;
        };
        let cancelled = run.cancel();
        if cancelled {
            info!(plan_id, "Run cancellation requested");
        }
        cancelled
    }

    /// Status of an active run, `None` if the plan has no active run.
    pub fn status(&self, plan_id: &str) -> Option<RunStatus> {
        self.active(plan_id).map(|run| run.status())
    }

    /// Plan ids with an active run, sorted.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn active(&self, plan_id: &str) -> Option<Arc<RunContext>> {
        self.runs.read().get(plan_id).cloned()
    }
}

/// Background task that carries one run from start to eviction.
struct RunDriver {
    plan: ExecutionPlan,
    run: Arc<RunContext>,
    executor: FlowExecutor,
    store: Arc<dyn PlanStore>,
    runs: ActiveRuns,
}

impl RunDriver {
    async fn drive(self, done: oneshot::Sender<RunReport>) {
        let plan_id = self.plan.plan_id.clone();
        let eviction = Eviction {
            runs: &self.runs,
            plan_id: self.run.plan_id(),
            run: &self.run,
        };

        let outcome = match self.executor.acquire_slot(&self.run).await {
            None => Outcome::Cancelled,
            Some(_slot) => {
                self.run.mark_running();
                info!(plan_id = %plan_id, "Run started");
                self.persist_status().await;

                if self.run.checkpoint().await {
                    self.executor.execute_unit(&self.plan.root, &self.run).await
                } else {
                    Outcome::Cancelled
                }
            }
        };

        // A cancel that lands after the root returned still wins
        let outcome = match self.run.finish(&outcome) {
            RunState::Cancelled => Outcome::Cancelled,
            _ => outcome,
        };
        // Stop detached parallel children still running in the background
        self.run.cancellation().cancel();
        self.persist_status().await;

        let status = self.run.status();
        match &outcome {
            Outcome::Success => info!(
                plan_id = %plan_id,
                completed = status.completed_steps,
                total = status.total_steps,
                degraded = status.degraded,
                "Run completed"
            ),
            Outcome::Failure(failure) => error!(
                plan_id = %plan_id,
                step_id = %failure.step_id,
                kind = %failure.kind,
                message = %failure.message,
                "Run failed"
            ),
            Outcome::Cancelled => info!(plan_id = %plan_id, "Run cancelled"),
        }

        drop(eviction);
        if done.send(RunReport { outcome, status }).is_err() {
            debug!(plan_id = %plan_id, "Run handle dropped before completion");
        }
    }

    async fn persist_status(&self) {
        let status = self.run.status();
        if let Err(e) = self.store.save_run_status(self.run.plan_id(), &status).await {
            warn!(plan_id = %self.run.plan_id(), state = %status.state, error = %e, "Failed to persist run status");
            self.run.mark_degraded();
        }
    }
}

/// Removes a run from the active table when dropped, including on panic.
struct Eviction<'a> {
    runs: &'a ActiveRuns,
    plan_id: &'a str,
    run: &'a Arc<RunContext>,
}

impl Drop for Eviction<'_> {
    fn drop(&mut self) {
        let mut runs = self.runs.write();
        if runs
            .get(self.plan_id)
            .is_some_and(|active| Arc::ptr_eq(active, self.run))
        {
            runs.remove(self.plan_id);
        }
    }
}

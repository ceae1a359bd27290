//! In-memory plan store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PlanStore, StoreError};
use crate::plan::ExecutionPlan;
use crate::run::RunStatus;

/// Process-local plan store.
///
/// Keeps every status write so callers can inspect the history of a run.
/// [`set_unavailable`](Self::set_unavailable) makes every call fail, which
/// is how tests exercise degraded runs.
#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: RwLock<HashMap<String, ExecutionPlan>>,
    statuses: RwLock<HashMap<String, Vec<RunStatus>>>,
    completions: RwLock<HashMap<String, Vec<String>>>,
    unavailable: AtomicBool,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-loaded with plans.
    pub fn with_plans(plans: impl IntoIterator<Item = ExecutionPlan>) -> Self {
        let store = Self::new();
        for plan in plans {
            store.insert_plan(plan);
        }
        store
    }

    /// Add or replace a plan.
    pub fn insert_plan(&self, plan: ExecutionPlan) {
        self.plans.write().insert(plan.plan_id.clone(), plan);
    }

    /// Make every store call fail with `Unavailable` (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Most recent status written for a plan.
    pub fn last_status(&self, plan_id: &str) -> Option<RunStatus> {
        self.statuses
            .read()
            .get(plan_id)
            .and_then(|history| history.last().cloned())
    }

    /// Every status written for a plan, oldest first.
    pub fn status_history(&self, plan_id: &str) -> Vec<RunStatus> {
        self.statuses.read().get(plan_id).cloned().unwrap_or_default()
    }

    /// Step completions recorded for a plan, in write order.
    pub fn completed_steps(&self, plan_id: &str) -> Vec<String> {
        self.completions
            .read()
            .get(plan_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn load_plan(&self, plan_id: &str) -> Result<ExecutionPlan, StoreError> {
        self.check_available()?;
        self.plans
            .read()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(plan_id.to_string()))
    }

    async fn save_run_status(&self, plan_id: &str, status: &RunStatus) -> Result<(), StoreError> {
        self.check_available()?;
        self.statuses
            .write()
            .entry(plan_id.to_string())
            .or_default()
            .push(status.clone());
        Ok(())
    }

    async fn save_step_completion(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.completions
            .write()
            .entry(plan_id.to_string())
            .or_default()
            .push(step_id.to_string());
        Ok(())
    }
}

//! Plan store seam.
//!
//! The engine never persists anything on its own. Plans are read through a
//! [`PlanStore`] and run progress is written back through it; write failures
//! are logged by the coordinator and surface as a degraded run, never as a
//! run failure.

mod file;
mod memory;

pub use file::FilePlanStore;
pub use memory::InMemoryPlanStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::plan::ExecutionPlan;
use crate::run::RunStatus;

/// Errors from a plan store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Plan not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable access to plans and run progress.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Load a plan definition.
    async fn load_plan(&self, plan_id: &str) -> Result<ExecutionPlan, StoreError>;

    /// Record the latest status of a run.
    async fn save_run_status(&self, plan_id: &str, status: &RunStatus) -> Result<(), StoreError>;

    /// Record that a step completed.
    async fn save_step_completion(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError>;
}

//! Error types for the execution engine.

use thiserror::Error;

use crate::store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by coordinator-level operations.
///
/// Failures inside a running flow are not errors; they resolve the node to
/// [`Outcome::Failure`](crate::executor::Outcome) and end up on the run status.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan store has no plan with this id.
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// A run for this plan is already active.
    #[error("Plan is already running: {0}")]
    AlreadyRunning(String),

    /// The plan failed validation.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Plan store failure while loading a plan.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The run task panicked or was aborted.
    #[error("Internal error: {0}")]
    Internal(String),
}

//! Execution orchestration engine for Nebula plans.
//!
//! Walks a plan's flow tree, dispatches steps to pluggable invokers, runs
//! parallel groups on a bounded worker pool, gates steps on human approval,
//! and exposes start/pause/resume/cancel/status for each run.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  ExecutionCoordinator                                     │
//! │  - Active-run table (plan id → RunContext)                │
//! │  - Bounded worker pool shared by all runs                 │
//! │  - Persists progress through a PlanStore                  │
//! │                                                           │
//! │   ┌───────────────────┐     ┌──────────────────────────┐  │
//! │   │  FlowExecutor     │────▶│  InvokerRegistry         │  │
//! │   │  sequential/      │     │  capability → invoker    │  │
//! │   │  parallel/loop/.. │     └──────────────────────────┘  │
//! │   │                   │     ┌──────────────────────────┐  │
//! │   │                   │────▶│  ApprovalGate            │  │
//! │   └───────────────────┘     │  one oneshot per ticket  │  │
//! │                             └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod approval;
pub mod condition;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod http;
pub mod invoker;
pub mod plan;
pub mod run;
pub mod store;
pub mod template;

pub use approval::{ApprovalEvent, ApprovalGate, ApprovalStatus, ApprovalTicket};
pub use condition::{Predicate, PredicateError};
pub use coordinator::{EngineConfig, ExecutionCoordinator, RunHandle, RunReport};
pub use error::{EngineError, Result};
pub use executor::{FailureKind, FlowExecutor, Outcome, StepFailure};
pub use http::HttpInvoker;
pub use invoker::{
    FnInvoker, InvocationContext, InvokeError, InvokerRegistry, StepInvoker, StepRequest,
    StepResult,
};
pub use plan::{ExecutionPlan, FlowNode, StepSpec};
pub use run::{RunContext, RunState, RunStatus, SharedState};
pub use store::{FilePlanStore, InMemoryPlanStore, PlanStore, StoreError};
pub use template::{TemplateError, TemplateResolver, resolve_params};

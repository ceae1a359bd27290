//! Step invoker seam.
//!
//! A [`StepInvoker`] performs the work behind a capability. Invokers are
//! registered per capability in an [`InvokerRegistry`]; the executor looks
//! them up by a step's `capability` field.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::run::SharedState;

/// Errors an invoker can return instead of a [`StepResult`].
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The capability ran and failed.
    #[error("Step failed: {0}")]
    Failed(String),

    /// The capability could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The capability answered with something that is not a step result.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Everything an invoker receives about one step invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub plan_id: String,
    pub step_id: String,
    pub capability: String,
    /// Step parameters with templates already resolved.
    pub params: Value,
    /// Snapshot of the run's shared state at dispatch time.
    pub shared_state: SharedState,
}

/// Outcome reported by a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    /// Keys to merge into shared state.
    #[serde(default)]
    pub output: SharedState,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepResult {
    /// A successful result with no output.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A successful result carrying output.
    pub fn with_output(output: SharedState) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// A failed result.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: SharedState::new(),
            error: Some(error.into()),
        }
    }

    /// Add one output entry.
    pub fn insert(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }
}

/// Per-invocation context.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub plan_id: String,
    /// The step's timeout. The executor enforces it; invokers may pass it on.
    pub timeout: Duration,
    /// Fires when the run is cancelled.
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Performs the work behind a capability.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &StepRequest,
        ctx: &InvocationContext,
    ) -> Result<StepResult, InvokeError>;
}

type InvokeFn = dyn Fn(StepRequest, InvocationContext) -> BoxFuture<'static, Result<StepResult, InvokeError>>
    + Send
    + Sync;

/// Invoker backed by an async closure.
pub struct FnInvoker {
    f: Arc<InvokeFn>,
}

impl FnInvoker {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StepRequest, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult, InvokeError>> + Send + 'static,
    {
        Self {
            f: Arc::new(
                move |req: StepRequest,
                      ctx: InvocationContext|
                      -> BoxFuture<'static, Result<StepResult, InvokeError>> {
                    Box::pin(f(req, ctx))
                },
            ),
        }
    }
}

#[async_trait]
impl StepInvoker for FnInvoker {
    async fn invoke(
        &self,
        request: &StepRequest,
        ctx: &InvocationContext,
    ) -> Result<StepResult, InvokeError> {
        (self.f)(request.clone(), ctx.clone()).await
    }
}

/// Capability → invoker table.
#[derive(Clone, Default)]
pub struct InvokerRegistry {
    invokers: HashMap<String, Arc<dyn StepInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker for a capability, replacing any existing one.
    pub fn register<I: StepInvoker + 'static>(&mut self, capability: impl Into<String>, invoker: I) {
        self.invokers.insert(capability.into(), Arc::new(invoker));
    }

    /// Register a shared invoker.
    pub fn register_arc(&mut self, capability: impl Into<String>, invoker: Arc<dyn StepInvoker>) {
        self.invokers.insert(capability.into(), invoker);
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, capability: impl Into<String>, f: F)
    where
        F: Fn(StepRequest, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult, InvokeError>> + Send + 'static,
    {
        self.register(capability, FnInvoker::new(f));
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn StepInvoker>> {
        self.invokers.get(capability).cloned()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.invokers.contains_key(capability)
    }

    /// Registered capability names, sorted.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.invokers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(capability: &str) -> StepRequest {
        StepRequest {
            plan_id: "p".into(),
            step_id: "s".into(),
            capability: capability.into(),
            params: json!({"n": 2}),
            shared_state: SharedState::new(),
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            plan_id: "p".into(),
            timeout: Duration::from_secs(5),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_fn_invoker() {
        let invoker = FnInvoker::new(|req: StepRequest, _ctx| async move {
            let n = req.params["n"].as_i64().unwrap_or(0);
            Ok(StepResult::ok().insert("double", json!(n * 2)))
        });
        let result = invoker.invoke(&request("math"), &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["double"], json!(4));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = InvokerRegistry::new();
        assert!(registry.is_empty());
        registry.register_fn("echo", |req: StepRequest, _ctx| async move {
            Ok(StepResult::with_output(
                req.params.as_object().cloned().unwrap_or_default(),
            ))
        });
        registry.register_fn("fail", |_req, _ctx| async move {
            Err(InvokeError::Failed("nope".into()))
        });

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capabilities(), vec!["echo", "fail"]);
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());

        let echo = registry.get("echo").unwrap();
        let result = echo.invoke(&request("echo"), &ctx()).await.unwrap();
        assert_eq!(result.output["n"], json!(2));

        let fail = registry.get("fail").unwrap();
        let err = fail.invoke(&request("fail"), &ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "Step failed: nope");
    }

    #[test]
    fn test_step_result_constructors() {
        let failed = StepResult::failed("bad input");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("bad input"));

        let parsed: StepResult = serde_json::from_value(json!({"success": true})).unwrap();
        assert_eq!(parsed, StepResult::ok());
    }
}

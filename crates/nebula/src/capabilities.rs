//! Built-in demo capabilities plus configured remote ones.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use nebula_config::NebulaConfig;
use nebula_engine::{HttpInvoker, InvokeError, InvokerRegistry, StepRequest, StepResult};
use serde_json::Value;
use tracing::info;

/// Default pause for `sleep` when no `ms` param is given.
const DEFAULT_SLEEP_MS: u64 = 1000;

/// Build the invoker registry for a CLI run.
///
/// - `echo`: logs `params.message` and stores the params under the step id
/// - `set`: merges the params object into shared state
/// - `sleep`: waits `params.ms` milliseconds
/// - `fail`: always fails with `params.message`
///
/// Capabilities listed under `[invoker.http]` are routed to the data plane and
/// take precedence over the built-ins.
pub fn registry(config: &NebulaConfig) -> Result<InvokerRegistry> {
    let mut registry = InvokerRegistry::new();

    registry.register_fn("echo", |req: StepRequest, _ctx| async move {
        let message = req
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(plan_id = %req.plan_id, step_id = %req.step_id, "{}", message);
        Ok(StepResult::ok().insert(req.step_id.clone(), req.params.clone()))
    });

    registry.register_fn("set", |req: StepRequest, _ctx| async move {
        match req.params {
            Value::Object(map) => Ok(StepResult::with_output(map)),
            other => Err(InvokeError::Failed(format!(
                "set expects an object of params, got {}",
                other
            ))),
        }
    });

    registry.register_fn("sleep", |req: StepRequest, _ctx| async move {
        let ms = req
            .params
            .get("ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_SLEEP_MS);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(StepResult::ok())
    });

    registry.register_fn("fail", |req: StepRequest, _ctx| async move {
        let message = req
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Err(InvokeError::Failed(message.to_string()))
    });

    if let Some(section) = config.http_invoker() {
        let invoker = Arc::new(
            HttpInvoker::from_config(section).context("Failed to build HTTP invoker")?,
        );
        for capability in &section.capabilities {
            registry.register_arc(capability.clone(), invoker.clone());
        }
    }

    Ok(registry)
}

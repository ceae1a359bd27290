//! Remote step invoker.
//!
//! Forwards a step to a data-plane service over HTTP:
//!
//! ```text
//! POST {base_url}/api/v1/agents/{capability}/invoke
//! { "plan_id": ..., "step_id": ..., "capability": ..., "params": {...}, "shared_state": {...} }
//! ```
//!
//! The response body is a [`StepResult`].

use std::time::Duration;

use async_trait::async_trait;
use nebula_config::HttpInvokerSection;
use tracing::debug;

use crate::invoker::{InvocationContext, InvokeError, StepInvoker, StepRequest, StepResult};

/// Connection timeout for the data plane.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Invokes capabilities hosted by a remote data plane.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    http: reqwest::Client,
    base_url: String,
}

impl HttpInvoker {
    pub fn new(base_url: impl Into<String>) -> Result<Self, InvokeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InvokeError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(section: &HttpInvokerSection) -> Result<Self, InvokeError> {
        Self::new(section.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, capability: &str) -> String {
        format!("{}/api/v1/agents/{}/invoke", self.base_url, capability)
    }
}

#[async_trait]
impl StepInvoker for HttpInvoker {
    async fn invoke(
        &self,
        request: &StepRequest,
        ctx: &InvocationContext,
    ) -> Result<StepResult, InvokeError> {
        let url = self.endpoint(&request.capability);
        debug!(plan_id = %request.plan_id, step_id = %request.step_id, %url, "Invoking remote capability");

        let response = self
            .http
            .post(&url)
            .json(request)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::Failed(format!(
                "{} returned {}: {}",
                request.capability, status, body
            )));
        }

        response
            .json::<StepResult>()
            .await
            .map_err(|e| InvokeError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::SharedState;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> StepRequest {
        let mut shared_state = SharedState::new();
        shared_state.insert("topic".into(), json!("rust"));
        StepRequest {
            plan_id: "p1".into(),
            step_id: "write".into(),
            capability: "coder".into(),
            params: json!({"task": "write docs"}),
            shared_state,
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            plan_id: "p1".into(),
            timeout: Duration::from_secs(5),
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let invoker = HttpInvoker::new("http://localhost:8081/").unwrap();
        assert_eq!(invoker.base_url(), "http://localhost:8081");
        assert_eq!(
            invoker.endpoint("coder"),
            "http://localhost:8081/api/v1/agents/coder/invoke"
        );
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/coder/invoke"))
            .and(body_partial_json(json!({
                "step_id": "write",
                "params": {"task": "write docs"},
                "shared_state": {"topic": "rust"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "output": {"code": "fn main() {}"}
            })))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new(server.uri()).unwrap();
        let result = invoker.invoke(&request(), &ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["code"], json!("fn main() {}"));
    }

    #[tokio::test]
    async fn test_invoke_reported_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "compiler exploded"
            })))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new(server.uri()).unwrap();
        let result = invoker.invoke(&request(), &ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("compiler exploded"));
    }

    #[tokio::test]
    async fn test_invoke_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new(server.uri()).unwrap();
        let err = invoker.invoke(&request(), &ctx()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Failed(ref msg) if msg.contains("503") && msg.contains("overloaded")));
    }

    #[tokio::test]
    async fn test_invoke_invalid_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new(server.uri()).unwrap();
        let err = invoker.invoke(&request(), &ctx()).await.unwrap_err();
        assert!(matches!(err, InvokeError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_invoke_unreachable() {
        // Port 9 (discard) on localhost is almost never listening
        let invoker = HttpInvoker::new("http://127.0.0.1:9").unwrap();
        let err = invoker.invoke(&request(), &ctx()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Transport(_)));
    }
}

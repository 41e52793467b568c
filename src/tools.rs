use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Inputs handed to an executor for one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tenant_id: String,
    pub exception_id: Uuid,
    pub step_order: Option<i32>,
    pub tool_id: String,
    pub attempt: i32,
    pub input: Value,
    pub config: Value,
}

/// Business-level result of a tool run. A failure here is an outcome to
/// report downstream, not a worker error.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success { output: Value },
    Failure { error: String },
}

/// Infrastructure-level failure: the invocation never produced an outcome
/// and the envelope should be retried.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("transient tool failure: {0}")]
    Transient(String),
}

/// Opaque effector contract. The core never inspects what a tool does; it
/// only records executions and routes outcomes.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutcome, ToolError>;
}

/// Config-scripted executor for development and tests. The step's
/// `action_config.simulate` block declares the behaviour:
/// `{"transient_failures": 2, "fail": false, "output": {...}}`.
#[derive(Debug, Default)]
pub struct SimulatedExecutor;

#[async_trait]
impl ToolExecutor for SimulatedExecutor {
    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutcome, ToolError> {
        let simulate = request.config.get("simulate").cloned().unwrap_or(json!({}));

        let transient_failures = simulate
            .get("transient_failures")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        if request.attempt <= transient_failures {
            return Err(ToolError::Transient(format!(
                "simulated transient failure on attempt {}",
                request.attempt
            )));
        }

        if simulate.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            let error = simulate
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("simulated tool failure")
                .to_string();
            return Ok(ToolOutcome::Failure { error });
        }

        let output = simulate
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({ "ok": true, "tool_id": request.tool_id }));
        Ok(ToolOutcome::Success { output })
    }
}

/// Delegating executor: POSTs the input payload to the step's declared URL.
/// 2xx is success (response body becomes the output), other 4xx is a
/// reported failure, 5xx and transport errors retry.
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        WebhookExecutor {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for WebhookExecutor {
    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutcome, ToolError> {
        let Some(url) = request.config.get("url").and_then(Value::as_str) else {
            return Ok(ToolOutcome::Failure {
                error: format!("tool {} declares no webhook url", request.tool_id),
            });
        };

        let body = json!({
            "tenant_id": request.tenant_id,
            "exception_id": request.exception_id,
            "tool_id": request.tool_id,
            "step_order": request.step_order,
            "attempt": request.attempt,
            "input": request.input,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ToolError::Transient(format!("webhook unreachable: {err}")))?;

        let status = response.status();
        if status.is_success() {
            let output = response.json::<Value>().await.unwrap_or(json!({}));
            Ok(ToolOutcome::Success { output })
        } else if status.is_server_error() {
            Err(ToolError::Transient(format!("webhook returned {status}")))
        } else {
            let detail = response.text().await.unwrap_or_default();
            Ok(ToolOutcome::Failure {
                error: format!("webhook rejected invocation ({status}): {detail}"),
            })
        }
    }
}

/// Executors keyed by the `executor` field of a tool step's action config.
pub struct ToolExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn ToolExecutor>>,
}

impl ToolExecutorRegistry {
    pub fn bootstrap() -> Self {
        let mut executors: HashMap<&'static str, Arc<dyn ToolExecutor>> = HashMap::new();
        executors.insert("simulated", Arc::new(SimulatedExecutor));
        executors.insert("webhook", Arc::new(WebhookExecutor::new()));
        ToolExecutorRegistry { executors }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.get(kind).cloned()
    }
}

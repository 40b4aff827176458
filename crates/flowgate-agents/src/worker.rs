//! Worker-facing interface.
//!
//! [`WorkerClient`] is how the coordinator reaches an agent; a remote transport
//! implements it outside this crate. [`LocalWorkerPool`] runs agents in
//! process, which is what tests and the demo server use.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// The step ran and reported a failure
    #[error("Step failed: {0}")]
    StepFailed(String),

    /// The agent could not be reached or crashed mid-call
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// The agent did not answer in time
    #[error("Step timed out after {0:.1}s")]
    Timeout(f64),
}

/// Sends a step to a specific agent and awaits its reply.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn execute_step(
        &self,
        agent_id: &str,
        action: &str,
        parameters: &Value,
        timeout: Duration,
    ) -> Result<Value, WorkerError>;
}

/// Step logic run by an in-process agent.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, action: &str, parameters: &Value) -> Result<Value, WorkerError>;
}

/// External analysis/text-generation service a step handler may call.
/// Its behavior is opaque to the orchestrator.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, prompt: &str, context: &Value) -> Result<Value, WorkerError>;
}

/// In-process agents keyed by agent id
#[derive(Default)]
pub struct LocalWorkerPool {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl LocalWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, agent_id: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.write().insert(agent_id.into(), handler);
    }

    pub fn remove_handler(&self, agent_id: &str) -> bool {
        self.handlers.write().remove(agent_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[async_trait]
impl WorkerClient for LocalWorkerPool {
    async fn execute_step(
        &self,
        agent_id: &str,
        action: &str,
        parameters: &Value,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        let handler = self
            .handlers
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| WorkerError::Unreachable(format!("no local worker for {}", agent_id)))?;

        debug!(agent_id = %agent_id, action = %action, "Running step in process");

        tokio::time::timeout(timeout, handler.handle(action, parameters))
            .await
            .map_err(|_| WorkerError::Timeout(timeout.as_secs_f64()))?
    }
}

/// Handler that reports what it was asked to do after an optional delay
pub struct EchoHandler {
    agent_id: String,
    latency: Duration,
}

impl EchoHandler {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl StepHandler for EchoHandler {
    async fn handle(&self, action: &str, parameters: &Value) -> Result<Value, WorkerError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        Ok(serde_json::json!({
            "agent_id": self.agent_id,
            "action": action,
            "parameters": parameters,
            "status": "ok",
        }))
    }
}

/// Adapts an [`AnalysisService`] into a step handler. The prompt comes from
/// the `prompt` parameter, falling back to the action name; the remaining
/// parameters are passed as context.
pub struct AnalysisStepHandler {
    service: Arc<dyn AnalysisService>,
}

impl AnalysisStepHandler {
    pub fn new(service: Arc<dyn AnalysisService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StepHandler for AnalysisStepHandler {
    async fn handle(&self, action: &str, parameters: &Value) -> Result<Value, WorkerError> {
        let prompt = parameters
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or(action)
            .to_string();

        let analysis = self.service.analyze(&prompt, parameters).await?;

        Ok(serde_json::json!({
            "action": action,
            "analysis": analysis,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAnalysis;

    #[async_trait]
    impl AnalysisService for FixedAnalysis {
        async fn analyze(&self, prompt: &str, _context: &Value) -> Result<Value, WorkerError> {
            Ok(serde_json::json!({ "summary": format!("analyzed: {}", prompt) }))
        }
    }

    #[tokio::test]
    async fn test_local_pool_routes_to_handler() {
        let pool = LocalWorkerPool::new();
        pool.add_handler("a", Arc::new(EchoHandler::new("a")));

        let result = pool
            .execute_step("a", "scan", &serde_json::json!({"host": "db-1"}), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result["agent_id"], "a");
        assert_eq!(result["action"], "scan");
        assert_eq!(result["parameters"]["host"], "db-1");
    }

    #[tokio::test]
    async fn test_local_pool_unknown_agent_is_unreachable() {
        let pool = LocalWorkerPool::new();
        let result = pool
            .execute_step("ghost", "scan", &Value::Null, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(WorkerError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_local_pool_enforces_timeout() {
        let pool = LocalWorkerPool::new();
        pool.add_handler(
            "slow",
            Arc::new(EchoHandler::new("slow").with_latency(Duration::from_millis(500))),
        );

        let result = pool
            .execute_step("slow", "scan", &Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(WorkerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_analysis_handler_uses_prompt_parameter() {
        let handler = AnalysisStepHandler::new(Arc::new(FixedAnalysis));

        let result = handler
            .handle("summarize", &serde_json::json!({"prompt": "ticket 42"}))
            .await
            .unwrap();
        assert_eq!(result["analysis"]["summary"], "analyzed: ticket 42");

        let result = handler.handle("summarize", &Value::Null).await.unwrap();
        assert_eq!(result["analysis"]["summary"], "analyzed: summarize");
    }
}

//! The orchestrator service: one struct owning every component and
//! exposing the control operations.

use flowgate_agents::{Agent, AgentRegistry, InterventionHandler, TaskCoordinator, WorkerClient};
use flowgate_core::{EventBus, OrchestratorConfig, Scope, Subscription};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::engine::ExecutionEngine;
use crate::execution::{ExecutionStatus, StatusReport, WorkflowExecution};
use crate::graph::{ValidationReport, WorkflowDefinition};
use crate::monitor::ExecutionMonitor;
use crate::Result;

pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: EventBus,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<TaskCoordinator>,
    gate: ApprovalGate,
    engine: ExecutionEngine,
    monitor: ExecutionMonitor,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component from the configuration. Background loops are
    /// started separately with [`Orchestrator::start`].
    pub fn new(config: OrchestratorConfig, worker: Arc<dyn WorkerClient>) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(&config.events);
        let registry = Arc::new(AgentRegistry::new(config.registry.clone(), bus.clone()));
        let gate = ApprovalGate::new(config.approval.clone(), bus.clone());

        let intervention: Arc<dyn InterventionHandler> = Arc::new(gate.clone());
        let coordinator = Arc::new(
            TaskCoordinator::new(
                registry.clone(),
                worker,
                bus.clone(),
                config.coordinator.clone(),
            )
            .with_intervention_handler(intervention),
        );

        let engine = ExecutionEngine::new(
            coordinator.clone(),
            gate.clone(),
            bus.clone(),
            config.engine.clone(),
        );
        let monitor = ExecutionMonitor::new(
            Arc::new(engine.clone()),
            bus.clone(),
            config.monitor.clone(),
        );

        Ok(Self {
            config,
            bus,
            registry,
            coordinator,
            gate,
            engine,
            monitor,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the agent health loop, the approval sweeper and the monitor
    /// sweep. Calling it again is a no-op.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }

        background.push(
            self.coordinator
                .clone()
                .start_health_monitor(self.shutdown.clone()),
        );
        background.push(self.gate.start_sweeper(self.shutdown.clone()));
        background.push(self.monitor.start(self.shutdown.clone()));

        info!(
            agents = self.registry.len(),
            "Orchestrator background loops started"
        );
    }

    /// Stop the background loops and watchdogs
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        info!("Orchestrator stopped");
    }

    pub async fn submit(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input_variables: HashMap<String, Value>,
    ) -> Result<String> {
        self.submit_as(definition, input_variables, None).await
    }

    /// Submit on behalf of `owner`, who becomes the default approval requester
    pub async fn submit_as(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input_variables: HashMap<String, Value>,
        owner: Option<String>,
    ) -> Result<String> {
        let execution_id = self
            .engine
            .submit(definition, input_variables, owner)
            .await?;
        self.monitor.watch(&execution_id, self.shutdown.child_token());
        Ok(execution_id)
    }

    pub async fn pause(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.engine.pause(execution_id).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.engine.resume(execution_id).await
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.engine.cancel(execution_id).await
    }

    pub async fn get_status(&self, execution_id: &str) -> Result<StatusReport> {
        self.engine.get_status(execution_id).await
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.engine.get_execution(execution_id).await
    }

    pub async fn list_executions(&self) -> Vec<WorkflowExecution> {
        self.engine.list_executions().await
    }

    pub async fn purge(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.engine.purge(execution_id).await
    }

    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<StatusReport> {
        self.engine.wait_for_terminal(execution_id, timeout).await
    }

    /// Record a human decision on a pending approval request
    pub async fn respond_to_approval(
        &self,
        request_id: &str,
        approved: bool,
        resolver: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest> {
        Ok(self
            .gate
            .provide_approval(request_id, approved, resolver, reason)
            .await?)
    }

    /// Envelopes for one execution (`<id>` or `execution:<id>`), one workflow
    /// (`workflow:<id>`) or everything (`*`)
    pub fn subscribe(&self, scope: impl Into<Scope>) -> Subscription {
        self.bus.subscribe(scope)
    }

    pub fn register_agent(&self, agent: Agent) -> Result<()> {
        Ok(self.registry.register(agent)?)
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        Ok(self.registry.heartbeat(agent_id)?)
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Result<Agent> {
        Ok(self.registry.unregister(agent_id)?)
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        definition.validate()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn approval_gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowError;
    use flowgate_agents::{AgentBuilder, EchoHandler, LocalWorkerPool};

    fn orchestrator() -> Orchestrator {
        let pool = LocalWorkerPool::new();
        pool.add_handler("echo-1", Arc::new(EchoHandler::new("echo-1")));
        let orchestrator = Orchestrator::new(OrchestratorConfig::default(), Arc::new(pool)).unwrap();
        orchestrator
            .register_agent(AgentBuilder::new("echo-1").capability("scan").build())
            .unwrap();
        orchestrator
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = OrchestratorConfig::default();
        config.approval.high_risk_threshold = 1.5;

        let result = Orchestrator::new(config, Arc::new(LocalWorkerPool::new()));
        assert!(matches!(result, Err(WorkflowError::Core(_))));
    }

    #[tokio::test]
    async fn test_agent_lifecycle_passthrough() {
        let orchestrator = orchestrator();
        assert!(orchestrator.heartbeat("echo-1").is_ok());
        assert!(matches!(
            orchestrator.heartbeat("missing"),
            Err(WorkflowError::Coordination(_))
        ));

        let agent = orchestrator.unregister_agent("echo-1").unwrap();
        assert_eq!(agent.id, "echo-1");
        assert!(orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let orchestrator = orchestrator();
        orchestrator.start();
        orchestrator.start();
        assert_eq!(orchestrator.background.lock().len(), 3);

        orchestrator.shutdown().await;
        assert!(orchestrator.background.lock().is_empty());
    }
}

//! Task coordination: capability matching, queueing and reassignment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowgate_core::{CoordinationEvent, CoordinationEventType, CoordinatorConfig, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::AgentRegistry;
use crate::worker::{WorkerClient, WorkerError};
use crate::{CoordinationError, Result};

/// Upper bound on how long a queued task sleeps between availability checks
const QUEUE_RECHECK: Duration = Duration::from_secs(1);

/// One step to run on some agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub action: String,
    /// Capability required; derived from the action when absent
    pub capability: Option<String>,
    pub parameters: Value,
    pub timeout_secs: f64,
    pub preferred_agent: Option<String>,
    pub execution_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
}

impl TaskRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            capability: None,
            parameters: Value::Object(Default::default()),
            timeout_secs: 300.0,
            preferred_agent: None,
            execution_id: None,
            workflow_id: None,
            node_id: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_preferred_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent_id.into());
        self
    }

    pub fn for_node(
        mut self,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        self.execution_id = Some(execution_id.into());
        self.workflow_id = Some(workflow_id.into());
        self.node_id = Some(node_id.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

/// Result of a single assignment attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Assigned { agent_id: String },
    Queued { position: usize },
}

/// A task waiting for a capable agent
#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub task_id: String,
    pub capability: String,
    pub action: String,
    pub execution_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Output of a completed task and the agent that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub output: Value,
}

/// A task currently running on an agent
#[derive(Debug, Clone, Serialize)]
pub struct InFlightTask {
    pub task_id: String,
    pub agent_id: String,
    pub capability: String,
    pub started_at: DateTime<Utc>,
}

/// Receives tasks the coordinator could not place on any agent.
#[async_trait]
pub trait InterventionHandler: Send + Sync {
    /// Ask a human to step in. Returns the id of the created request.
    async fn request_intervention(&self, task: &TaskRequest, reason: &str) -> Option<String>;
}

struct InFlightEntry {
    info: InFlightTask,
    agent_lost: CancellationToken,
}

enum DispatchFailure {
    Timeout,
    Step(String),
    AgentLost(String),
}

/// Releases the agent slot and in-flight entry even if the dispatch future
/// is dropped by an outer timeout.
struct DispatchGuard<'a> {
    coordinator: &'a TaskCoordinator,
    task_id: &'a str,
    agent_id: String,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.in_flight.remove(self.task_id);
        self.coordinator.registry.release(&self.agent_id);
    }
}

/// Removes a task from the wait queue however the waiting ends.
struct QueueGuard<'a> {
    coordinator: &'a TaskCoordinator,
    task_id: &'a str,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.dequeue(self.task_id);
    }
}

pub struct TaskCoordinator {
    registry: Arc<AgentRegistry>,
    client: Arc<dyn WorkerClient>,
    bus: EventBus,
    config: CoordinatorConfig,
    queue: Mutex<VecDeque<QueuedTask>>,
    in_flight: DashMap<String, InFlightEntry>,
    intervention: Option<Arc<dyn InterventionHandler>>,
}

impl TaskCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<dyn WorkerClient>,
        bus: EventBus,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            client,
            bus,
            config,
            queue: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            intervention: None,
        }
    }

    /// Route unplaceable tasks to a human decision process
    pub fn with_intervention_handler(mut self, handler: Arc<dyn InterventionHandler>) -> Self {
        self.intervention = Some(handler);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Capability a task needs: explicit, mapped from the action, or the
    /// action name itself
    pub fn required_capability(&self, task: &TaskRequest) -> String {
        task.capability
            .clone()
            .or_else(|| self.config.action_capabilities.get(&task.action).cloned())
            .unwrap_or_else(|| task.action.clone())
    }

    /// Try to place a task once. A task that cannot be placed is queued, never
    /// handed to an agent lacking the capability.
    pub fn assign_task(&self, task: &TaskRequest, preferred_agent: Option<&str>) -> Assignment {
        let capability = self.required_capability(task);
        self.try_assign(task, &capability, preferred_agent, &HashSet::new())
    }

    fn try_assign(
        &self,
        task: &TaskRequest,
        capability: &str,
        preferred_agent: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Assignment {
        let reserved = if self.has_queued_ahead(&task.id, capability) {
            None
        } else {
            preferred_agent
                .filter(|agent_id| !exclude.contains(*agent_id))
                .filter(|agent_id| self.registry.reserve_preferred(agent_id, capability))
                .map(str::to_string)
                .or_else(|| self.registry.reserve(capability, exclude))
        };

        match reserved {
            Some(agent_id) => {
                self.dequeue(&task.id);
                debug!(
                    task_id = %task.id,
                    agent_id = %agent_id,
                    capability = %capability,
                    "Task assigned"
                );
                self.bus.publish_coordination(self.task_event(
                    CoordinationEventType::TaskAssigned,
                    task,
                    serde_json::json!({ "capability": capability, "action": task.action }),
                    None,
                    Some(&agent_id),
                ));
                Assignment::Assigned { agent_id }
            }
            None => Assignment::Queued {
                position: self.enqueue(task, capability),
            },
        }
    }

    /// Run a task to completion on some capable agent.
    ///
    /// Waits in the queue while no capable agent is free, reassigns when the
    /// agent fails, and requests manual intervention when nobody can take it.
    pub async fn execute(&self, task: &TaskRequest) -> Result<TaskResult> {
        let capability = self.required_capability(task);
        let mut excluded = HashSet::new();
        let mut agent_id = self.acquire(task, &capability, &excluded).await?;

        loop {
            match self.dispatch(task, &agent_id, &capability).await {
                Ok(output) => {
                    self.bus.publish_coordination(self.task_event(
                        CoordinationEventType::TaskCompleted,
                        task,
                        serde_json::json!({ "capability": capability }),
                        Some(&agent_id),
                        None,
                    ));
                    return Ok(TaskResult {
                        task_id: task.id.clone(),
                        agent_id,
                        output,
                    });
                }
                Err(DispatchFailure::Timeout) => {
                    self.publish_task_failed(task, &agent_id, "timeout");
                    return Err(CoordinationError::Timeout {
                        task_id: task.id.clone(),
                        timeout_secs: task.timeout_secs,
                    });
                }
                Err(DispatchFailure::Step(message)) => {
                    self.publish_task_failed(task, &agent_id, &message);
                    return Err(CoordinationError::StepFailed { agent_id, message });
                }
                Err(DispatchFailure::AgentLost(reason)) => {
                    self.publish_task_failed(task, &agent_id, &reason);
                    excluded.insert(agent_id.clone());
                    agent_id = self
                        .reassign(task, &agent_id, &capability, &excluded, &reason)
                        .await?;
                }
            }
        }
    }

    /// Wait in the queue until a capable agent is reserved or the wait budget
    /// runs out.
    async fn acquire(
        &self,
        task: &TaskRequest,
        capability: &str,
        exclude: &HashSet<String>,
    ) -> Result<String> {
        let _queue_guard = QueueGuard {
            coordinator: self,
            task_id: &task.id,
        };
        let started = Instant::now();
        let deadline = started + self.config.queue_wait();
        let mut announced = false;

        loop {
            let notified = self.registry.availability_changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_assign(task, capability, task.preferred_agent.as_deref(), exclude) {
                Assignment::Assigned { agent_id } => return Ok(agent_id),
                Assignment::Queued { position } => {
                    if !announced {
                        announced = true;
                        self.announce_queued(task, capability, position);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_secs = (now - started).as_secs_f64();
                let reason = format!(
                    "no agent with capability '{}' available after {:.1}s",
                    capability, waited_secs
                );
                let intervention = self.escalate(task, capability, None, &reason).await;
                return Err(CoordinationError::NoCapableAgent {
                    capability: capability.to_string(),
                    waited_secs,
                    intervention,
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.min(now + QUEUE_RECHECK)) => {}
            }
        }
    }

    async fn dispatch(
        &self,
        task: &TaskRequest,
        agent_id: &str,
        capability: &str,
    ) -> std::result::Result<Value, DispatchFailure> {
        let agent_lost = CancellationToken::new();
        self.in_flight.insert(
            task.id.clone(),
            InFlightEntry {
                info: InFlightTask {
                    task_id: task.id.clone(),
                    agent_id: agent_id.to_string(),
                    capability: capability.to_string(),
                    started_at: Utc::now(),
                },
                agent_lost: agent_lost.clone(),
            },
        );
        let _guard = DispatchGuard {
            coordinator: self,
            task_id: &task.id,
            agent_id: agent_id.to_string(),
        };

        let timeout = task.timeout();
        let call = self
            .client
            .execute_step(agent_id, &task.action, &task.parameters, timeout);

        tokio::select! {
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(WorkerError::StepFailed(message))) => Err(DispatchFailure::Step(message)),
                Ok(Err(WorkerError::Timeout(_))) | Err(_) => Err(DispatchFailure::Timeout),
                Ok(Err(WorkerError::Unreachable(reason))) => Err(DispatchFailure::AgentLost(reason)),
            },
            _ = agent_lost.cancelled() => Err(DispatchFailure::AgentLost(
                "agent failed its health check".to_string(),
            )),
        }
    }

    /// Move a task off a failed agent onto the least loaded alternate.
    async fn reassign(
        &self,
        task: &TaskRequest,
        failed_agent: &str,
        capability: &str,
        exclude: &HashSet<String>,
        reason: &str,
    ) -> Result<String> {
        self.registry.mark_unhealthy(failed_agent, reason);

        if let Some(alternate) = self.registry.reserve(capability, exclude) {
            info!(
                task_id = %task.id,
                failed_agent = %failed_agent,
                agent_id = %alternate,
                "Task reassigned"
            );
            self.bus.publish_coordination(self.task_event(
                CoordinationEventType::TaskReassigned,
                task,
                serde_json::json!({ "capability": capability, "reason": reason }),
                Some(failed_agent),
                Some(&alternate),
            ));
            return Ok(alternate);
        }

        let message = format!(
            "agent {} failed ({}) and no alternate agent has capability '{}'",
            failed_agent, reason, capability
        );
        let intervention = self
            .escalate(task, capability, Some(failed_agent), &message)
            .await;

        Err(CoordinationError::NoAlternateAgent {
            capability: capability.to_string(),
            failed_agent: failed_agent.to_string(),
            intervention,
        })
    }

    /// Raise a system alert and hand the task to the intervention handler.
    /// Returns the id of the intervention request, if one was opened.
    async fn escalate(
        &self,
        task: &TaskRequest,
        capability: &str,
        failed_agent: Option<&str>,
        reason: &str,
    ) -> Option<String> {
        error!(
            task_id = %task.id,
            capability = %capability,
            reason = %reason,
            "Task cannot be placed on any agent"
        );

        let intervention_id = match &self.intervention {
            Some(handler) => handler.request_intervention(task, reason).await,
            None => None,
        };

        self.bus.publish_coordination(self.task_event(
            CoordinationEventType::SystemAlert,
            task,
            serde_json::json!({
                "alert": "task_unplaceable",
                "capability": capability,
                "reason": reason,
                "intervention_request_id": intervention_id,
            }),
            failed_agent,
            None,
        ));

        intervention_id
    }

    /// React to an agent failure detected outside a dispatch (for example by
    /// the health check): every task running on it is reassigned.
    /// Returns the affected task ids.
    pub fn handle_agent_failure(&self, agent_id: &str, reason: &str) -> Vec<String> {
        self.registry.mark_unhealthy(agent_id, reason);

        let affected: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.info.agent_id == agent_id)
            .map(|entry| {
                entry.agent_lost.cancel();
                entry.info.task_id.clone()
            })
            .collect();

        if !affected.is_empty() {
            warn!(
                agent_id = %agent_id,
                tasks = affected.len(),
                "Reassigning tasks from failed agent"
            );
        }

        affected
    }

    /// One pass of the registry health check plus reassignment
    pub fn run_health_checks(&self) -> Vec<String> {
        let unhealthy = self.registry.check_health(Utc::now());
        for agent_id in &unhealthy {
            self.handle_agent_failure(agent_id, "heartbeat timeout");
        }
        unhealthy
    }

    /// Periodic health check loop, stopped by the token
    pub fn start_health_monitor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = self.registry.config().health_check_interval();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Agent health monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_health_checks();
                    }
                    _ = shutdown.cancelled() => {
                        info!("Agent health monitor stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Tasks waiting for an agent, oldest first
    pub fn queued_tasks(&self) -> Vec<QueuedTask> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn in_flight(&self) -> Vec<InFlightTask> {
        self.in_flight
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    fn has_queued_ahead(&self, task_id: &str, capability: &str) -> bool {
        self.queue
            .lock()
            .iter()
            .take_while(|queued| queued.task_id != task_id)
            .any(|queued| queued.capability == capability)
    }

    fn enqueue(&self, task: &TaskRequest, capability: &str) -> usize {
        let mut queue = self.queue.lock();
        if let Some(position) = queue.iter().position(|queued| queued.task_id == task.id) {
            return position;
        }

        queue.push_back(QueuedTask {
            task_id: task.id.clone(),
            capability: capability.to_string(),
            action: task.action.clone(),
            execution_id: task.execution_id.clone(),
            enqueued_at: Utc::now(),
        });
        queue.len() - 1
    }

    fn dequeue(&self, task_id: &str) {
        self.queue.lock().retain(|queued| queued.task_id != task_id);
    }

    fn announce_queued(&self, task: &TaskRequest, capability: &str, position: usize) {
        let registered = self.registry.has_capability(capability);
        warn!(
            task_id = %task.id,
            capability = %capability,
            position,
            capability_registered = registered,
            "No capable agent available, task queued"
        );

        self.bus.publish_coordination(self.task_event(
            CoordinationEventType::TaskQueued,
            task,
            serde_json::json!({ "capability": capability, "position": position }),
            None,
            None,
        ));
        self.bus.publish_coordination(self.task_event(
            CoordinationEventType::SystemAlert,
            task,
            serde_json::json!({
                "alert": "no_capable_agent",
                "capability": capability,
                "capability_registered": registered,
            }),
            None,
            None,
        ));
    }

    fn publish_task_failed(&self, task: &TaskRequest, agent_id: &str, reason: &str) {
        self.bus.publish_coordination(self.task_event(
            CoordinationEventType::TaskFailed,
            task,
            serde_json::json!({ "reason": reason }),
            Some(agent_id),
            None,
        ));
    }

    fn task_event(
        &self,
        event_type: CoordinationEventType,
        task: &TaskRequest,
        mut payload: Value,
        source: Option<&str>,
        target: Option<&str>,
    ) -> CoordinationEvent {
        if let Value::Object(map) = &mut payload {
            map.insert("task_id".to_string(), Value::String(task.id.clone()));
            if let Some(node_id) = &task.node_id {
                map.insert("node_id".to_string(), Value::String(node_id.clone()));
            }
        }

        let mut event = CoordinationEvent::new(event_type, payload);
        if let Some(source) = source {
            event = event.with_source(source);
        }
        if let Some(target) = target {
            event = event.with_target(target);
        }
        if let Some(execution_id) = &task.execution_id {
            event = event.with_execution(execution_id);
        }
        if let Some(workflow_id) = &task.workflow_id {
            event = event.with_workflow(workflow_id);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentBuilder;
    use crate::worker::{EchoHandler, LocalWorkerPool, StepHandler};
    use flowgate_core::RegistryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingHandler;

    #[async_trait]
    impl StepHandler for FailingHandler {
        async fn handle(&self, _action: &str, _parameters: &Value) -> std::result::Result<Value, WorkerError> {
            Err(WorkerError::Unreachable("connection reset".to_string()))
        }
    }

    struct BrokenStep;

    #[async_trait]
    impl StepHandler for BrokenStep {
        async fn handle(&self, _action: &str, _parameters: &Value) -> std::result::Result<Value, WorkerError> {
            Err(WorkerError::StepFailed("disk full".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingIntervention {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InterventionHandler for RecordingIntervention {
        async fn request_intervention(&self, _task: &TaskRequest, _reason: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some("manual-1".to_string())
        }
    }

    struct Fixture {
        bus: EventBus,
        registry: Arc<AgentRegistry>,
        pool: Arc<LocalWorkerPool>,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = EventBus::default();
            let registry = Arc::new(AgentRegistry::new(RegistryConfig::default(), bus.clone()));
            Self {
                bus,
                registry,
                pool: Arc::new(LocalWorkerPool::new()),
            }
        }

        fn agent(&self, id: &str, capability: &str, handler: Arc<dyn StepHandler>) {
            self.registry
                .register(AgentBuilder::new(id).capability(capability).build())
                .unwrap();
            self.pool.add_handler(id, handler);
        }

        fn coordinator(&self, queue_wait_secs: f64) -> TaskCoordinator {
            let config = CoordinatorConfig {
                queue_wait_secs,
                ..Default::default()
            };
            TaskCoordinator::new(
                self.registry.clone(),
                self.pool.clone(),
                self.bus.clone(),
                config,
            )
        }
    }

    #[test]
    fn test_required_capability_resolution() {
        let fixture = Fixture::new();
        let mut config = CoordinatorConfig::default();
        config
            .action_capabilities
            .insert("isolate_host".to_string(), "security".to_string());
        let coordinator = TaskCoordinator::new(
            fixture.registry.clone(),
            fixture.pool.clone(),
            fixture.bus.clone(),
            config,
        );

        assert_eq!(
            coordinator.required_capability(&TaskRequest::new("isolate_host")),
            "security"
        );
        assert_eq!(
            coordinator.required_capability(&TaskRequest::new("triage")),
            "triage"
        );
        assert_eq!(
            coordinator.required_capability(&TaskRequest::new("isolate_host").with_capability("ops")),
            "ops"
        );
    }

    #[test]
    fn test_assign_queues_when_no_capable_agent() {
        let fixture = Fixture::new();
        fixture.agent("a", "x", Arc::new(EchoHandler::new("a")));
        let coordinator = fixture.coordinator(1.0);

        let task = TaskRequest::new("run").with_capability("c");
        assert_eq!(
            coordinator.assign_task(&task, None),
            Assignment::Queued { position: 0 }
        );
        assert_eq!(coordinator.queued_tasks().len(), 1);
        assert_eq!(fixture.registry.get("a").unwrap().in_flight, 0);
    }

    #[test]
    fn test_assign_honors_idle_preferred_agent() {
        let fixture = Fixture::new();
        fixture.agent("a", "x", Arc::new(EchoHandler::new("a")));
        fixture.agent("b", "x", Arc::new(EchoHandler::new("b")));
        let coordinator = fixture.coordinator(1.0);

        let task = TaskRequest::new("run").with_capability("x");
        assert_eq!(
            coordinator.assign_task(&task, Some("b")),
            Assignment::Assigned { agent_id: "b".to_string() }
        );

        // Busy preferred agent falls back to capability matching
        let task = TaskRequest::new("run").with_capability("x");
        assert_eq!(
            coordinator.assign_task(&task, Some("b")),
            Assignment::Assigned { agent_id: "a".to_string() }
        );
    }

    #[tokio::test]
    async fn test_execute_runs_on_capable_agent() {
        let fixture = Fixture::new();
        fixture.agent("a", "x", Arc::new(EchoHandler::new("a")));
        let coordinator = fixture.coordinator(1.0);

        let result = tokio_test::assert_ok!(
            coordinator
                .execute(&TaskRequest::new("run").with_capability("x"))
                .await
        );

        assert_eq!(result.agent_id, "a");
        assert_eq!(result.output["action"], "run");
        assert_eq!(fixture.registry.get("a").unwrap().in_flight, 0);
        assert!(coordinator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_queued_task_runs_when_agent_frees_up() {
        let fixture = Fixture::new();
        fixture.agent(
            "a",
            "x",
            Arc::new(EchoHandler::new("a").with_latency(Duration::from_millis(200))),
        );
        let coordinator = Arc::new(fixture.coordinator(5.0));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(&TaskRequest::new("run").with_capability("x"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = coordinator
            .execute(&TaskRequest::new("run").with_capability("x"))
            .await;

        assert!(first.await.unwrap().is_ok());
        assert!(second.is_ok());
        assert!(coordinator.queued_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_queue_wait_exhaustion_requests_intervention() {
        let fixture = Fixture::new();
        let intervention = Arc::new(RecordingIntervention::default());
        let coordinator = fixture
            .coordinator(0.2)
            .with_intervention_handler(intervention.clone());
        let mut alerts = fixture.bus.subscribe("*");

        let result = coordinator
            .execute(&TaskRequest::new("run").with_capability("c"))
            .await;

        let error = tokio_test::assert_err!(result);
        assert!(matches!(error, CoordinationError::NoCapableAgent { .. }));
        assert_eq!(error.intervention_request(), Some("manual-1"));
        assert_eq!(intervention.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.queued_tasks().is_empty());

        let types: Vec<_> = alerts.drain().into_iter().map(|e| e.event_type).collect();
        assert!(types.contains(&"task_queued".to_string()));
        assert!(types.contains(&"system_alert".to_string()));
    }

    #[tokio::test]
    async fn test_task_events_carry_workflow_id() {
        let fixture = Fixture::new();
        fixture.agent("a", "x", Arc::new(EchoHandler::new("a")));
        let coordinator = fixture.coordinator(1.0);
        let mut workflow = fixture.bus.subscribe("workflow:wf-1");
        let mut other = fixture.bus.subscribe("workflow:wf-2");

        let task = TaskRequest::new("run")
            .with_capability("x")
            .for_node("ex-1", "wf-1", "step");
        tokio_test::assert_ok!(coordinator.execute(&task).await);

        let types: Vec<_> = workflow.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["task_assigned", "task_completed"]);
        assert!(other.drain().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_without_handler_has_no_request() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(0.1);

        let error = tokio_test::assert_err!(
            coordinator
                .execute(&TaskRequest::new("run").with_capability("c"))
                .await
        );
        assert_eq!(error.intervention_request(), None);
    }

    #[tokio::test]
    async fn test_failed_agent_reassigns_to_alternate() {
        let fixture = Fixture::new();
        fixture.agent("broken", "x", Arc::new(FailingHandler));
        fixture.agent("backup", "x", Arc::new(EchoHandler::new("backup")));
        let coordinator = fixture.coordinator(1.0);

        let result = coordinator
            .execute(&TaskRequest::new("run").with_capability("x"))
            .await
            .unwrap();

        assert_eq!(result.agent_id, "backup");
        assert_eq!(
            fixture.registry.get("broken").unwrap().health,
            crate::agent::AgentHealth::Unhealthy
        );
        let reassigned = fixture
            .bus
            .history_for_agent("backup")
            .into_iter()
            .any(|e| e.event_type == CoordinationEventType::TaskReassigned);
        assert!(reassigned);
    }

    #[tokio::test]
    async fn test_failed_agent_without_alternate_escalates() {
        let fixture = Fixture::new();
        fixture.agent("broken", "x", Arc::new(FailingHandler));
        let intervention = Arc::new(RecordingIntervention::default());
        let coordinator = fixture
            .coordinator(1.0)
            .with_intervention_handler(intervention.clone());

        let result = coordinator
            .execute(&TaskRequest::new("run").with_capability("x"))
            .await;

        let error = tokio_test::assert_err!(result);
        assert!(matches!(error, CoordinationError::NoAlternateAgent { .. }));
        assert_eq!(error.intervention_request(), Some("manual-1"));
        assert_eq!(intervention.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.registry.get("broken").unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_step_failure_is_not_reassigned() {
        let fixture = Fixture::new();
        fixture.agent("a", "x", Arc::new(BrokenStep));
        fixture.agent("b", "x", Arc::new(EchoHandler::new("b")));
        let coordinator = fixture.coordinator(1.0);

        let result = coordinator
            .execute(&TaskRequest::new("run").with_capability("x"))
            .await;

        match result {
            Err(CoordinationError::StepFailed { agent_id, message }) => {
                assert_eq!(agent_id, "a");
                assert_eq!(message, "disk full");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            fixture.registry.get("a").unwrap().health,
            crate::agent::AgentHealth::Healthy
        );
    }

    #[tokio::test]
    async fn test_timeout_releases_agent() {
        let fixture = Fixture::new();
        fixture.agent(
            "slow",
            "x",
            Arc::new(EchoHandler::new("slow").with_latency(Duration::from_secs(5))),
        );
        let coordinator = fixture.coordinator(1.0);

        let started = std::time::Instant::now();
        let result = coordinator
            .execute(&TaskRequest::new("run").with_capability("x").with_timeout(0.2))
            .await;

        assert!(matches!(result, Err(CoordinationError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fixture.registry.get("slow").unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_health_failure_moves_in_flight_task() {
        let fixture = Fixture::new();
        fixture.agent(
            "stuck",
            "x",
            Arc::new(EchoHandler::new("stuck").with_latency(Duration::from_secs(10))),
        );
        fixture.agent("fresh", "x", Arc::new(EchoHandler::new("fresh")));
        // Occupy "fresh" so the task lands on "stuck" first
        assert!(fixture.registry.reserve_preferred("fresh", "x"));

        let coordinator = Arc::new(fixture.coordinator(1.0));
        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(&TaskRequest::new("run").with_capability("x"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.in_flight().len(), 1);
        fixture.registry.release("fresh");

        let affected = coordinator.handle_agent_failure("stuck", "heartbeat timeout");
        assert_eq!(affected.len(), 1);

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.agent_id, "fresh");
    }

    #[tokio::test]
    async fn test_dropped_execute_releases_reservation() {
        let fixture = Fixture::new();
        fixture.agent(
            "slow",
            "x",
            Arc::new(EchoHandler::new("slow").with_latency(Duration::from_secs(5))),
        );
        let coordinator = fixture.coordinator(1.0);

        let task = TaskRequest::new("run").with_capability("x");
        let outer = tokio::time::timeout(Duration::from_millis(100), coordinator.execute(&task)).await;

        assert!(outer.is_err());
        assert_eq!(fixture.registry.get("slow").unwrap().in_flight, 0);
        assert!(coordinator.in_flight().is_empty());
    }
}

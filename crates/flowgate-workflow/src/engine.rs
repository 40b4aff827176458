//! Execution engine: drives workflow runs over the execution graph.
//!
//! Each execution gets one driver task. The driver spawns a task per node
//! visit and reacts to their completions: it records the result, evaluates
//! outgoing edges and fires successors once all of their forward inputs have
//! arrived. Edges that are not taken propagate as dead paths so joins never
//! wait forever. Pause holds newly ready nodes back; cancel and the overall
//! timeout end the run immediately and detach whatever is still in flight.

use chrono::Utc;
use flowgate_agents::{CoordinationError, TaskCoordinator, TaskRequest};
use flowgate_core::{topics, EngineConfig, Envelope, EventBus};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approval::{
    ApprovalError, ApprovalGate, ApprovalOutcome, ApprovalStatus, ApprovalSubmission,
    ApprovalTicket,
};
use crate::condition::{interpolate, ConditionError};
use crate::execution::{
    ExecutionStatus, NodeExecution, NodeStatus, StatusReport, WorkflowExecution,
};
use crate::graph::{
    ApprovalNodeConfig, DecisionConfig, DelayConfig, ExecutionGraph, Node, NodeType, TaskConfig,
    WorkflowDefinition,
};
use crate::monitor::ExecutionSource;
use crate::retry::RetryPolicy;
use crate::{Result, WorkflowError};

struct ExecutionEntry {
    execution: WorkflowExecution,
    graph: Arc<ExecutionGraph>,
    cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl ExecutionEntry {
    fn envelope<T: Serialize>(&self, event_type: &str, topic: &str, payload: T) -> Envelope {
        Envelope::new(event_type, topic, payload)
            .for_execution(&self.execution.id, &self.execution.workflow_id)
    }

    /// Apply a status change and announce it
    fn set_status(&mut self, bus: &EventBus, next: ExecutionStatus) -> bool {
        let previous = self.execution.status;
        if !self.execution.transition(next) {
            return false;
        }
        self.status_tx.send_replace(next);

        bus.publish(self.envelope(
            "execution_status",
            topics::EXECUTION,
            json!({
                "status": next,
                "previous": previous,
                "error": self.execution.error,
            }),
        ));
        true
    }

    /// Recompute progress and announce it when it changed
    fn refresh_progress(&mut self, bus: &EventBus) {
        let progress = compute_progress(&self.execution, &self.graph);
        if (progress - self.execution.progress).abs() > f64::EPSILON {
            self.execution.progress = progress;
            bus.publish(self.envelope(
                "execution_progress",
                topics::EXECUTION,
                json!({ "progress": progress }),
            ));
        }
    }

    fn is_active(&self) -> bool {
        !self.execution.status.is_terminal()
    }
}

/// Share of non-start nodes whose latest visit completed or was skipped
fn compute_progress(execution: &WorkflowExecution, graph: &ExecutionGraph) -> f64 {
    let total = graph.progress_nodes().count();
    if total == 0 {
        return 0.0;
    }

    let done = graph
        .progress_nodes()
        .filter(|node| {
            matches!(
                execution.latest_node(&node.id).map(|record| record.status),
                Some(NodeStatus::Completed | NodeStatus::Skipped)
            )
        })
        .count();

    ((done as f64 / total as f64) * 10_000.0).round() / 100.0
}

/// Workflow execution engine
#[derive(Clone)]
pub struct ExecutionEngine {
    /// Executions by id, retained until purged
    executions: Arc<RwLock<HashMap<String, ExecutionEntry>>>,
    coordinator: Arc<TaskCoordinator>,
    gate: ApprovalGate,
    bus: EventBus,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        coordinator: Arc<TaskCoordinator>,
        gate: ApprovalGate,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
            coordinator,
            gate,
            bus,
            config,
        }
    }

    pub fn approval_gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    /// Validate a definition and start an execution of it.
    ///
    /// Invalid definitions and missing required variables are rejected
    /// without creating an execution.
    pub async fn submit(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input_variables: HashMap<String, Value>,
        owner: Option<String>,
    ) -> Result<String> {
        let definition = definition.into();
        let graph = ExecutionGraph::build(definition.clone()).map_err(WorkflowError::Validation)?;
        let graph = Arc::new(graph);

        let mut variables = input_variables.clone();
        for declared in &definition.variables {
            if variables.contains_key(&declared.name) {
                continue;
            }
            match &declared.default {
                Some(default) => {
                    variables.insert(declared.name.clone(), default.clone());
                }
                None if declared.required => {
                    return Err(WorkflowError::MissingVariable(declared.name.clone()));
                }
                None => {}
            }
        }

        let execution = WorkflowExecution::new(&definition, input_variables, variables, owner);
        let execution_id = execution.id.clone();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Pending);

        let entry = ExecutionEntry {
            execution,
            graph: graph.clone(),
            cancel: cancel.clone(),
            status_tx,
        };
        self.bus.publish(entry.envelope(
            "execution_created",
            topics::EXECUTION,
            json!({
                "workflow_version": definition.version,
                "owner": entry.execution.owner,
                "status": ExecutionStatus::Pending,
            }),
        ));

        {
            let mut executions = self.executions.write().await;
            executions.insert(execution_id.clone(), entry);
        }

        info!(
            workflow_id = %definition.id,
            execution_id = %execution_id,
            node_count = definition.nodes.len(),
            "Workflow execution created"
        );

        let driver = Driver {
            engine: self.clone(),
            execution_id: execution_id.clone(),
            workflow_id: definition.id.clone(),
            graph,
            cancel,
            status_rx,
            in_flight: FuturesUnordered::new(),
            arrivals: HashMap::new(),
            visits: HashMap::new(),
            held: VecDeque::new(),
            failures: Vec::new(),
        };
        tokio::spawn(driver.run());

        Ok(execution_id)
    }

    /// Stop dispatching new nodes. In-flight nodes keep running.
    pub async fn pause(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.control(execution_id, |_| Some(ExecutionStatus::Paused), ExecutionStatus::Paused)
            .await
    }

    /// Continue a paused execution; it returns to `waiting_approval` when
    /// approvals are still open.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.control(
            execution_id,
            |execution| match execution.status {
                ExecutionStatus::Paused if execution.pending_approvals.is_empty() => {
                    Some(ExecutionStatus::Running)
                }
                ExecutionStatus::Paused => Some(ExecutionStatus::WaitingApproval),
                _ => None,
            },
            ExecutionStatus::Running,
        )
        .await
    }

    /// End the execution now. In-flight work is detached and its results
    /// discarded; open approvals are cancelled.
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let status = self
            .control(
                execution_id,
                |_| Some(ExecutionStatus::Cancelled),
                ExecutionStatus::Cancelled,
            )
            .await?;

        self.gate.cancel_for_execution(execution_id).await;
        info!(execution_id = %execution_id, "Workflow execution cancelled");
        Ok(status)
    }

    /// Apply an operator status change. `next` picks the target status, or
    /// `None` to reject with `requested` as the attempted target.
    async fn control(
        &self,
        execution_id: &str,
        next: impl FnOnce(&WorkflowExecution) -> Option<ExecutionStatus>,
        requested: ExecutionStatus,
    ) -> Result<ExecutionStatus> {
        let mut executions = self.executions.write().await;
        let entry = executions
            .get_mut(execution_id)
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;

        let from = entry.execution.status;
        let to = match next(&entry.execution) {
            Some(to) if entry.set_status(&self.bus, to) => to,
            _ => {
                return Err(WorkflowError::InvalidStateTransition {
                    execution_id: execution_id.to_string(),
                    from,
                    to: requested,
                })
            }
        };

        if to == ExecutionStatus::Cancelled {
            discard_running_nodes(&mut entry.execution);
            entry.cancel.cancel();
        }

        info!(execution_id = %execution_id, from = %from, to = %to, "Execution status changed");
        Ok(to)
    }

    pub async fn get_status(&self, execution_id: &str) -> Result<StatusReport> {
        let executions = self.executions.read().await;
        executions
            .get(execution_id)
            .map(|entry| entry.execution.status_report())
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let executions = self.executions.read().await;
        executions
            .get(execution_id)
            .map(|entry| entry.execution.clone())
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))
    }

    /// All retained executions, oldest first
    pub async fn list_executions(&self) -> Vec<WorkflowExecution> {
        let executions = self.executions.read().await;
        let mut all: Vec<_> = executions
            .values()
            .map(|entry| entry.execution.clone())
            .collect();
        all.sort_by_key(|execution| execution.created_at);
        all
    }

    /// Drop a finished execution
    pub async fn purge(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let mut executions = self.executions.write().await;
        match executions.get(execution_id) {
            None => return Err(WorkflowError::NotFound(execution_id.to_string())),
            Some(entry) if entry.is_active() => {
                return Err(WorkflowError::NotTerminal(execution_id.to_string()))
            }
            Some(_) => {}
        }

        let entry = executions
            .remove(execution_id)
            .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?;
        debug!(execution_id = %execution_id, "Execution purged");
        Ok(entry.execution)
    }

    /// Wait until the execution reaches a terminal status or `timeout`
    /// elapses, then report its status either way.
    pub async fn wait_for_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<StatusReport> {
        let mut status_rx = {
            let executions = self.executions.read().await;
            executions
                .get(execution_id)
                .map(|entry| entry.status_tx.subscribe())
                .ok_or_else(|| WorkflowError::NotFound(execution_id.to_string()))?
        };

        let reached = tokio::time::timeout(timeout, async {
            status_rx.wait_for(|status| status.is_terminal()).await.is_ok()
        })
        .await
        .unwrap_or(false);
        if !reached {
            debug!(execution_id = %execution_id, "Execution not terminal within wait timeout");
        }
        self.get_status(execution_id).await
    }

    /// Run `f` against an active execution. Returns `None` when the execution
    /// is gone or already terminal.
    async fn with_active<R>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionEntry, &EventBus) -> R,
    ) -> Option<R> {
        let mut executions = self.executions.write().await;
        let entry = executions.get_mut(execution_id)?;
        if !entry.is_active() {
            return None;
        }
        Some(f(entry, &self.bus))
    }

    async fn update_record(
        &self,
        execution_id: &str,
        record: usize,
        f: impl FnOnce(&mut NodeExecution),
    ) {
        self.with_active(execution_id, |entry, _| {
            if let Some(node_execution) = entry.execution.node_executions.get_mut(record) {
                f(node_execution);
            }
        })
        .await;
    }

    async fn publish_for(&self, execution_id: &str, event_type: &str, topic: &str, payload: Value) {
        self.with_active(execution_id, |entry, bus| {
            bus.publish(entry.envelope(event_type, topic, payload));
        })
        .await;
    }

    /// Final status of a run
    async fn finish(&self, execution_id: &str, status: ExecutionStatus, error: Option<String>) {
        let finished = self
            .with_active(execution_id, |entry, bus| {
                if status == ExecutionStatus::Completed {
                    let input = &entry.execution.input_variables;
                    entry.execution.output_variables = entry
                        .execution
                        .variables
                        .iter()
                        .filter(|(name, _)| !input.contains_key(*name))
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect();
                    if entry.execution.progress < 100.0 {
                        entry.execution.progress = 100.0;
                        bus.publish(entry.envelope(
                            "execution_progress",
                            topics::EXECUTION,
                            json!({ "progress": 100.0 }),
                        ));
                    }
                } else {
                    discard_running_nodes(&mut entry.execution);
                }

                entry.execution.error = error.clone();
                entry.set_status(bus, status)
            })
            .await
            .unwrap_or(false);

        if !finished {
            return;
        }

        match status {
            ExecutionStatus::Completed => {
                info!(execution_id = %execution_id, "Workflow execution completed")
            }
            _ => {
                error!(
                    execution_id = %execution_id,
                    status = %status,
                    error = error.as_deref().unwrap_or(""),
                    "Workflow execution did not complete"
                );
                self.gate.cancel_for_execution(execution_id).await;
            }
        }
    }

    async fn run_task(&self, run: &NodeRun) -> Result<Value> {
        let config: TaskConfig = run
            .node
            .parse_config()
            .map_err(|e| run.failure(format!("invalid task config: {}", e)))?;

        let parameters = interpolate(&Value::Object(config.parameters.clone()), &run.variables);
        let timeout_secs = config
            .timeout_secs
            .unwrap_or(self.config.default_task_timeout_secs);
        let policy = RetryPolicy::for_task(&config, &self.config);

        {
            let parameters = parameters.clone();
            self.update_record(&run.execution_id, run.record, move |record| {
                record.input = parameters;
                record.timeout_secs = Some(timeout_secs);
            })
            .await;
        }

        let mut retries = 0;
        loop {
            let mut request = TaskRequest::new(&config.action)
                .with_parameters(parameters.clone())
                .with_timeout(timeout_secs)
                .for_node(&run.execution_id, &run.workflow_id, &run.node.id);
            if let Some(capability) = &config.capability {
                request = request.with_capability(capability);
            }
            if let Some(agent_id) = &config.preferred_agent {
                request = request.with_preferred_agent(agent_id);
            }

            match self.coordinator.execute(&request).await {
                Ok(result) => {
                    let agent_id = result.agent_id.clone();
                    self.update_record(&run.execution_id, run.record, move |record| {
                        record.agent_id = Some(agent_id);
                        record.error = None;
                    })
                    .await;
                    return Ok(result.output);
                }
                Err(e) if policy.should_retry(retries, &e) => {
                    let delay = policy.calculate_backoff(retries);
                    retries += 1;
                    let message = e.to_string();

                    warn!(
                        execution_id = %run.execution_id,
                        node_id = %run.node.id,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Task failed, retrying"
                    );

                    {
                        let message = message.clone();
                        self.update_record(&run.execution_id, run.record, move |record| {
                            record.retry_count = retries;
                            record.error = Some(message);
                        })
                        .await;
                    }
                    self.publish_for(
                        &run.execution_id,
                        "node_retry",
                        topics::NODE,
                        json!({
                            "node_id": run.node.id,
                            "attempt": retries,
                            "max_retries": policy.max_retries,
                            "delay_secs": delay.as_secs_f64(),
                            "error": message,
                        }),
                    )
                    .await;

                    tokio::time::sleep(delay).await;
                }
                Err(e) => match e.intervention_request().map(str::to_string) {
                    Some(request_id) => {
                        self.await_intervention(run, &request_id, &e).await?;
                        info!(
                            execution_id = %run.execution_id,
                            node_id = %run.node.id,
                            approval_id = %request_id,
                            "Intervention approved, placing task again"
                        );
                    }
                    None => return Err(e.into()),
                },
            }
        }
    }

    /// Hold the task branch on the manual-intervention request raised for
    /// it. Returns once an operator approves another placement attempt.
    async fn await_intervention(
        &self,
        run: &NodeRun,
        request_id: &str,
        cause: &CoordinationError,
    ) -> Result<()> {
        let expires_at = self
            .gate
            .get_request(request_id)
            .await
            .map(|request| request.expires_at)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        {
            let message = cause.to_string();
            self.update_record(&run.execution_id, run.record, move |record| {
                record.error = Some(message);
            })
            .await;
        }
        self.enter_waiting(run, request_id, expires_at).await;
        let outcome = self.gate.wait_for(request_id).await;
        self.leave_waiting(run, request_id).await;

        decide(outcome?)?;
        self.update_record(&run.execution_id, run.record, |record| {
            record.error = None;
        })
        .await;
        Ok(())
    }

    async fn run_approval(&self, run: &NodeRun) -> Result<Value> {
        let config: ApprovalNodeConfig = run
            .node
            .parse_config()
            .map_err(|e| run.failure(format!("invalid approval config: {}", e)))?;

        let context = match interpolate(&Value::Object(config.context.clone()), &run.variables) {
            Value::Object(context) => context,
            _ => config.context.clone(),
        };
        let action = config
            .action
            .clone()
            .unwrap_or_else(|| run.node.label().to_string());
        let requester = config
            .requester
            .clone()
            .or_else(|| run.owner.clone())
            .unwrap_or_else(|| "workflow".to_string());

        let mut submission = ApprovalSubmission::new(config.approval_type, action)
            .requester(requester)
            .context(context)
            .fallback(config.fallback)
            .for_node(&run.execution_id, &run.workflow_id, &run.node.id);
        if let Some(description) = &config.description {
            submission = submission.description(description);
        }
        if let Some(timeout_secs) = config.timeout_secs {
            submission = submission.timeout(Duration::from_secs_f64(timeout_secs.max(0.0)));
        }
        if config.always_require {
            submission = submission.always_require();
        }

        let pending = match self.gate.request_approval(submission).await {
            ApprovalTicket::AutoApproved {
                reason,
                rule_id,
                assessment,
            } => {
                return Ok(json!({
                    "approved": true,
                    "auto_approved": true,
                    "reason": reason,
                    "rule_id": rule_id,
                    "risk": assessment,
                }));
            }
            ApprovalTicket::Pending(pending) => pending,
        };

        let request_id = pending.request_id.clone();
        self.enter_waiting(run, &request_id, pending.expires_at).await;
        let outcome = self.gate.wait(pending).await;
        self.leave_waiting(run, &request_id).await;

        let outcome = decide(outcome?)?;
        Ok(serde_json::to_value(&outcome)?)
    }

    async fn enter_waiting(
        &self,
        run: &NodeRun,
        request_id: &str,
        expires_at: chrono::DateTime<Utc>,
    ) {
        let request_id = request_id.to_string();
        self.with_active(&run.execution_id, |entry, bus| {
            if let Some(record) = entry.execution.node_executions.get_mut(run.record) {
                record.status = NodeStatus::WaitingApproval;
                record.approval_request_id = Some(request_id.clone());
            }
            entry.execution.pending_approvals.push(request_id.clone());
            if entry.execution.status == ExecutionStatus::Running {
                entry.set_status(bus, ExecutionStatus::WaitingApproval);
            }

            bus.publish(entry.envelope(
                "node_waiting_approval",
                topics::NODE,
                json!({
                    "node_id": run.node.id,
                    "request_id": request_id,
                    "expires_at": expires_at,
                }),
            ));
        })
        .await;

        info!(
            execution_id = %run.execution_id,
            node_id = %run.node.id,
            approval_id = %request_id,
            "Node waiting for approval"
        );
    }

    async fn leave_waiting(&self, run: &NodeRun, request_id: &str) {
        self.with_active(&run.execution_id, |entry, bus| {
            if let Some(record) = entry.execution.node_executions.get_mut(run.record) {
                if record.status == NodeStatus::WaitingApproval {
                    record.status = NodeStatus::Running;
                }
            }
            entry
                .execution
                .pending_approvals
                .retain(|pending| pending != request_id);
            if entry.execution.status == ExecutionStatus::WaitingApproval
                && entry.execution.pending_approvals.is_empty()
            {
                entry.set_status(bus, ExecutionStatus::Running);
            }
        })
        .await;
    }

    /// One switch over the node type
    async fn run_node(&self, run: &NodeRun) -> Result<Value> {
        match &run.node.node_type {
            NodeType::Task => self.run_task(run).await,
            NodeType::Approval => self.run_approval(run).await,
            NodeType::Delay => {
                let config: DelayConfig = run
                    .node
                    .parse_config()
                    .map_err(|e| run.failure(format!("invalid delay config: {}", e)))?;
                tokio::time::sleep(Duration::from_secs_f64(config.duration_secs.max(0.0))).await;
                Ok(json!({ "delayed_secs": config.duration_secs }))
            }
            NodeType::Start
            | NodeType::End
            | NodeType::Decision
            | NodeType::Parallel
            | NodeType::Merge => Ok(Value::Null),
            NodeType::Other(kind) => {
                warn!(
                    execution_id = %run.execution_id,
                    node_id = %run.node.id,
                    node_type = %kind,
                    "Unknown node type, completing as a no-op"
                );
                Ok(Value::Null)
            }
        }
    }
}

/// Turn a negative decision into the matching error
fn decide(outcome: ApprovalOutcome) -> Result<ApprovalOutcome> {
    if outcome.approved {
        return Ok(outcome);
    }

    match outcome.status {
        ApprovalStatus::Expired => Err(WorkflowError::ApprovalTimeout(outcome.request_id)),
        _ => Err(WorkflowError::ApprovalDenied(format!(
            "approval request {} rejected by {}: {}",
            outcome.request_id,
            outcome.resolver.as_deref().unwrap_or("unknown"),
            outcome.reason.as_deref().unwrap_or("no reason given")
        ))),
    }
}

/// Mark still running node visits as cancelled; their results are discarded
fn discard_running_nodes(execution: &mut WorkflowExecution) {
    for record in execution.node_executions.iter_mut() {
        if matches!(record.status, NodeStatus::Running | NodeStatus::WaitingApproval) {
            record.finish(NodeStatus::Cancelled);
        }
    }
    execution.pending_approvals.clear();
}

#[async_trait::async_trait]
impl ExecutionSource for ExecutionEngine {
    async fn snapshot(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.get_execution(execution_id).await.ok()
    }

    async fn active_executions(&self) -> Vec<WorkflowExecution> {
        let executions = self.executions.read().await;
        executions
            .values()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.execution.clone())
            .collect()
    }
}

/// Everything a node task needs, captured at dispatch
struct NodeRun {
    execution_id: String,
    workflow_id: String,
    owner: Option<String>,
    node: Node,
    record: usize,
    variables: HashMap<String, Value>,
}

impl NodeRun {
    fn failure(&self, reason: String) -> WorkflowError {
        WorkflowError::NodeExecution {
            node_id: self.node.id.clone(),
            reason,
        }
    }
}

struct NodeCompletion {
    node_id: String,
    record: usize,
    result: Result<Value>,
}

#[derive(Default)]
struct Arrivals {
    edges: HashSet<usize>,
    live: bool,
}

/// Per execution state machine over node completions
struct Driver {
    engine: ExecutionEngine,
    execution_id: String,
    workflow_id: String,
    graph: Arc<ExecutionGraph>,
    cancel: CancellationToken,
    status_rx: watch::Receiver<ExecutionStatus>,
    in_flight: FuturesUnordered<BoxFuture<'static, NodeCompletion>>,
    /// Forward inputs received so far by nodes that have not fired yet
    arrivals: HashMap<String, Arrivals>,
    visits: HashMap<String, u32>,
    /// Nodes that became ready while paused
    held: VecDeque<String>,
    failures: Vec<(String, WorkflowError)>,
}

impl Driver {
    async fn run(mut self) {
        let started = self
            .engine
            .with_active(&self.execution_id, |entry, bus| {
                entry.set_status(bus, ExecutionStatus::Running)
            })
            .await
            .unwrap_or(false);
        if !started {
            return;
        }
        info!(
            execution_id = %self.execution_id,
            workflow_id = %self.workflow_id,
            "Workflow execution started"
        );

        let timeout_secs = self.graph.definition().timeout_secs;
        let deadline = timeout_secs.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
        let overall_timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(overall_timeout);

        for start in self.graph.start_nodes().to_vec() {
            self.fire(start).await;
        }

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.failures.is_empty() {
                self.fail().await;
                return;
            }

            let paused = self.is_paused();
            if !paused && !self.held.is_empty() {
                while let Some(node_id) = self.held.pop_front() {
                    self.dispatch(node_id).await;
                }
                continue;
            }
            if !paused && self.in_flight.is_empty() {
                self.engine
                    .finish(&self.execution_id, ExecutionStatus::Completed, None)
                    .await;
                return;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(execution_id = %self.execution_id, "Driver stopped by cancellation");
                    return;
                }
                _ = &mut overall_timeout => {
                    let message = format!(
                        "execution exceeded its timeout of {}s",
                        timeout_secs.unwrap_or_default()
                    );
                    self.engine
                        .finish(&self.execution_id, ExecutionStatus::Timeout, Some(message))
                        .await;
                    return;
                }
                changed = self.status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_completion(completion).await;
                }
            }
        }
    }

    fn is_paused(&mut self) -> bool {
        *self.status_rx.borrow_and_update() == ExecutionStatus::Paused
    }

    /// A node is ready: run it now, or hold it while paused
    async fn fire(&mut self, node_id: String) {
        if self.is_paused() {
            debug!(execution_id = %self.execution_id, node_id = %node_id, "Node held while paused");
            self.held.push_back(node_id);
        } else {
            self.dispatch(node_id).await;
        }
    }

    async fn dispatch(&mut self, node_id: String) {
        let Some(node) = self.graph.node(&node_id).cloned() else {
            let error = WorkflowError::NodeExecution {
                node_id: node_id.clone(),
                reason: "node is not part of the workflow".to_string(),
            };
            self.failures.push((node_id, error));
            return;
        };

        let visit = {
            let visits = self.visits.entry(node_id.clone()).or_insert(0);
            *visits += 1;
            *visits
        };

        let max_visits = self.engine.config.max_node_visits;
        let started = self
            .engine
            .with_active(&self.execution_id, |entry, bus| {
                let record = NodeExecution::started(&node.id, node.node_type.clone(), visit);
                bus.publish(entry.envelope("node_started", topics::NODE, &record));
                entry.execution.node_executions.push(record);
                (
                    entry.execution.node_executions.len() - 1,
                    entry.execution.variables.clone(),
                    entry.execution.owner.clone(),
                )
            })
            .await;
        let Some((record, variables, owner)) = started else {
            return;
        };

        if visit > max_visits {
            let error = WorkflowError::NodeExecution {
                node_id: node_id.clone(),
                reason: format!("exceeded the limit of {} visits", max_visits),
            };
            self.record_failure(&node_id, record, error).await;
            return;
        }

        debug!(
            execution_id = %self.execution_id,
            node_id = %node_id,
            node_type = %node.node_type,
            visit,
            "Dispatching node"
        );

        let run = NodeRun {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            owner,
            node,
            record,
            variables,
        };
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move { engine.run_node(&run).await });

        // Dropping the future detaches the task without aborting it
        self.in_flight.push(
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(WorkflowError::NodeExecution {
                        node_id: node_id.clone(),
                        reason: format!("node task ended abnormally: {}", e),
                    }),
                };
                NodeCompletion {
                    node_id,
                    record,
                    result,
                }
            }
            .boxed(),
        );
    }

    async fn on_completion(&mut self, completion: NodeCompletion) {
        let NodeCompletion {
            node_id,
            record,
            result,
        } = completion;

        let output = match result {
            Ok(output) => output,
            Err(error) => {
                self.record_failure(&node_id, record, error).await;
                return;
            }
        };

        let Some(node) = self.graph.node(&node_id).cloned() else {
            return;
        };

        // Outputs are visible to the node's own edge conditions
        let stored = self
            .engine
            .with_active(&self.execution_id, |entry, _| {
                if let Some(name) = output_name(&node) {
                    let variables = &mut entry.execution.variables;
                    variables.insert(node.id.clone(), output.clone());
                    if let Some(alias) = name {
                        variables.insert(alias, output.clone());
                    }
                }
                entry.execution.variables.clone()
            })
            .await;
        let Some(variables) = stored else {
            return;
        };

        let (taken, not_taken) = match select_edges(&self.graph, &node, &variables) {
            Ok(selection) => selection,
            Err(e) => {
                self.record_failure(&node_id, record, e.into()).await;
                return;
            }
        };

        self.engine
            .with_active(&self.execution_id, |entry, bus| {
                let finished = entry.execution.node_executions.get_mut(record).map(|node_execution| {
                    node_execution.output = Some(output);
                    node_execution.finish(NodeStatus::Completed);
                    node_execution.clone()
                });
                if let Some(node_execution) = finished {
                    bus.publish(entry.envelope("node_completed", topics::NODE, &node_execution));
                }
                entry.refresh_progress(bus);
            })
            .await;

        debug!(
            execution_id = %self.execution_id,
            node_id = %node_id,
            taken = taken.len(),
            "Node completed"
        );

        let graph = self.graph.clone();
        let loops_back = taken.iter().any(|edge| graph.is_back_edge(*edge));

        for edge in taken {
            let Some(target) = graph.edge(edge).map(|e| e.target.clone()) else {
                continue;
            };
            if graph.is_back_edge(edge) {
                self.fire(target).await;
            } else {
                self.arrive(target, edge, true).await;
            }
        }

        // A node that loops back will be visited again; its untaken exits stay open
        if !loops_back {
            for edge in not_taken {
                if graph.is_back_edge(edge) {
                    continue;
                }
                if let Some(target) = graph.edge(edge).map(|e| e.target.clone()) {
                    self.arrive(target, edge, false).await;
                }
            }
        }
    }

    /// Count a forward edge at its target and fire or skip the target once
    /// every forward input has arrived. Skips cascade down dead paths.
    async fn arrive(&mut self, target: String, edge: usize, live: bool) {
        let graph = self.graph.clone();
        let mut work = VecDeque::from([(target, edge, live)]);

        while let Some((target, edge, live)) = work.pop_front() {
            let expected = graph.forward_inputs(&target).len();
            let state = self.arrivals.entry(target.clone()).or_default();
            state.edges.insert(edge);
            state.live |= live;
            if state.edges.len() < expected {
                continue;
            }

            let any_live = state.live;
            self.arrivals.remove(&target);

            if any_live {
                self.fire(target).await;
                continue;
            }

            self.skip(&target).await;
            for &next in graph.outgoing(&target) {
                if graph.is_back_edge(next) {
                    continue;
                }
                if let Some(successor) = graph.edge(next).map(|e| e.target.clone()) {
                    work.push_back((successor, next, false));
                }
            }
        }
    }

    async fn skip(&mut self, node_id: &str) {
        let Some(node_type) = self.graph.node(node_id).map(|node| node.node_type.clone()) else {
            return;
        };
        let visit = {
            let visits = self.visits.entry(node_id.to_string()).or_insert(0);
            *visits += 1;
            *visits
        };

        self.engine
            .with_active(&self.execution_id, |entry, bus| {
                let record = NodeExecution::skipped(node_id, node_type, visit);
                bus.publish(entry.envelope("node_skipped", topics::NODE, &record));
                entry.execution.node_executions.push(record);
                entry.refresh_progress(bus);
            })
            .await;

        debug!(execution_id = %self.execution_id, node_id = %node_id, "Node skipped");
    }

    async fn record_failure(&mut self, node_id: &str, record: usize, error: WorkflowError) {
        let reason = error.to_string();
        warn!(
            execution_id = %self.execution_id,
            node_id = %node_id,
            error = %reason,
            "Node failed"
        );

        {
            let reason = reason.clone();
            self.engine
                .with_active(&self.execution_id, |entry, bus| {
                    let failed = entry.execution.node_executions.get_mut(record).map(|node_execution| {
                        node_execution.error = Some(reason);
                        node_execution.finish(NodeStatus::Failed);
                        node_execution.clone()
                    });
                    if let Some(node_execution) = failed {
                        bus.publish(entry.envelope("node_failed", topics::NODE, &node_execution));
                    }
                    entry.refresh_progress(bus);
                })
                .await;
        }

        self.failures.push((node_id.to_string(), error));
    }

    /// Fail the run with every failure already reported by in-flight nodes
    async fn fail(&mut self) {
        while let Some(Some(completion)) = self.in_flight.next().now_or_never() {
            if let Err(error) = completion.result {
                self.record_failure(&completion.node_id, completion.record, error)
                    .await;
            }
        }

        let ids: Vec<&str> = self.failures.iter().map(|(id, _)| id.as_str()).collect();
        let reasons: Vec<String> = self
            .failures
            .iter()
            .map(|(id, error)| format!("{}: {}", id, error))
            .collect();
        let message = format!("failed nodes [{}]: {}", ids.join(", "), reasons.join("; "));

        self.engine
            .finish(&self.execution_id, ExecutionStatus::Failed, Some(message))
            .await;
    }
}

/// Variable names a node's output is stored under: `Some(alias)` for task
/// nodes with an `output_variable`, `None` when the node stores no output.
fn output_name(node: &Node) -> Option<Option<String>> {
    match node.node_type {
        NodeType::Task => Some(
            node.parse_config::<TaskConfig>()
                .ok()
                .and_then(|config| config.output_variable),
        ),
        NodeType::Approval => Some(None),
        _ => None,
    }
}

/// Split outgoing edges into taken and not taken, in definition order.
///
/// Conditioned edges are taken when their condition holds. Unconditioned
/// edges are always taken, except after a decision node where they form the
/// else branch (with `default_target` preferred).
fn select_edges(
    graph: &ExecutionGraph,
    node: &Node,
    variables: &HashMap<String, Value>,
) -> std::result::Result<(Vec<usize>, Vec<usize>), ConditionError> {
    let outgoing = graph.outgoing(&node.id);
    let mut taken = HashSet::new();
    let mut matched = false;

    for &edge in outgoing {
        if let Some(condition) = graph.condition(edge) {
            if condition.evaluate(variables)? {
                taken.insert(edge);
                matched = true;
            }
        }
    }

    let unconditioned = outgoing
        .iter()
        .copied()
        .filter(|edge| graph.edge(*edge).map_or(false, |e| e.condition.is_none()));

    if node.node_type == NodeType::Decision {
        if !matched {
            let default_target = node
                .parse_config::<DecisionConfig>()
                .ok()
                .and_then(|config| config.default_target);
            match default_target {
                Some(target) => taken.extend(
                    outgoing
                        .iter()
                        .copied()
                        .filter(|edge| graph.edge(*edge).map_or(false, |e| e.target == target)),
                ),
                None => taken.extend(unconditioned),
            }
        }
    } else {
        taken.extend(unconditioned);
    }

    Ok(outgoing.iter().partition(|edge| taken.contains(*edge)))
}

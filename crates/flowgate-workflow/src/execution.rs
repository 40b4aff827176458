//! Execution records: one `WorkflowExecution` per run, one `NodeExecution`
//! per node visit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::graph::{NodeType, WorkflowDefinition};

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, driver not started yet
    Pending,
    Running,
    /// At least one branch is suspended on an approval
    WaitingApproval,
    /// No new nodes are dispatched; in-flight nodes keep running
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// The definition's overall timeout elapsed
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Allowed state machine edges
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        match (self, next) {
            (Pending, Running | Failed | Cancelled | Timeout) => true,
            (Running, WaitingApproval | Paused | Completed | Failed | Cancelled | Timeout) => true,
            (WaitingApproval, Running | Paused | Failed | Cancelled | Timeout) => true,
            (Paused, Running | WaitingApproval | Failed | Cancelled | Timeout) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one node visit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    /// Not taken: every incoming path was dead
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

/// Record of one node visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// 1 for the first visit, incremented each time a loop re-fires the node
    pub visit: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Retries performed so far
    pub retry_count: u32,
    /// Per attempt timeout for task nodes
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub agent_id: Option<String>,
    pub approval_request_id: Option<String>,
}

impl NodeExecution {
    pub fn started(node_id: impl Into<String>, node_type: NodeType, visit: u32) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            status: NodeStatus::Running,
            visit,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_secs: None,
            retry_count: 0,
            timeout_secs: None,
            input: Value::Null,
            output: None,
            error: None,
            agent_id: None,
            approval_request_id: None,
        }
    }

    pub fn skipped(node_id: impl Into<String>, node_type: NodeType, visit: u32) -> Self {
        let now = Utc::now();
        Self {
            status: NodeStatus::Skipped,
            started_at: None,
            completed_at: Some(now),
            ..Self::started(node_id, node_type, visit)
        }
    }

    /// Move to a terminal status and stamp completion time and duration
    pub fn finish(&mut self, status: NodeStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_secs = self
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
    }

    /// Seconds since the visit started
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// One run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    /// Percentage in `[0, 100]`
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_variables: HashMap<String, Value>,
    /// Inputs, declared defaults and node outputs
    pub variables: HashMap<String, Value>,
    /// Variables produced by the run, set on completion
    pub output_variables: HashMap<String, Value>,
    pub node_executions: Vec<NodeExecution>,
    /// Approval requests this execution is currently waiting on
    pub pending_approvals: Vec<String>,
    pub owner: Option<String>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(
        definition: &WorkflowDefinition,
        input_variables: HashMap<String, Value>,
        variables: HashMap<String, Value>,
        owner: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            workflow_version: definition.version.clone(),
            status: ExecutionStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_variables,
            variables,
            output_variables: HashMap::new(),
            node_executions: Vec::new(),
            pending_approvals: Vec::new(),
            owner,
            error: None,
        }
    }

    /// Apply a status change if the state machine allows it
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        true
    }

    /// Wall clock run time; up to now while still running
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    /// Most recent visit of a node
    pub fn latest_node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions
            .iter()
            .rev()
            .find(|record| record.node_id == node_id)
    }

    pub fn running_nodes(&self) -> impl Iterator<Item = (usize, &NodeExecution)> {
        self.node_executions
            .iter()
            .enumerate()
            .filter(|(_, record)| record.status == NodeStatus::Running)
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            execution_id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            progress: self.progress,
            node_executions: self.node_executions.clone(),
            error: self.error.clone(),
        }
    }
}

/// Answer to a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub node_executions: Vec<NodeExecution>,
    pub error: Option<String>,
}

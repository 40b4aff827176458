//! Workflow orchestration for Flowgate
//!
//! This crate provides:
//! - Workflow definitions, validation and the indexed execution graph
//! - Condition expressions for edge routing
//! - An event-driven execution engine with join semantics, retries,
//!   pause/resume and cancellation
//! - Human approval gates with risk scoring, escalation and rule learning
//! - Execution monitoring with stall detection, alerts and metrics
//! - The `Orchestrator` service wiring every component together

pub mod approval;
pub mod condition;
pub mod engine;
pub mod execution;
pub mod graph;
pub mod monitor;
pub mod retry;
pub mod service;

pub use approval::{
    ApprovalError, ApprovalFallback, ApprovalGate, ApprovalOutcome, ApprovalRequest,
    ApprovalStatus, ApprovalSubmission, ApprovalTicket, ApprovalType, AutoApprovalRule,
    PatternAnalysis, RiskAssessment, RiskLevel, RuleSuggestion, ThresholdSuggestion,
    TimeoutOutcome,
};
pub use condition::{Condition, ConditionError};
pub use engine::ExecutionEngine;
pub use execution::{ExecutionStatus, NodeExecution, NodeStatus, StatusReport, WorkflowExecution};
pub use graph::{
    ApprovalNodeConfig, DecisionConfig, DelayConfig, Edge, ExecutionGraph, Node, NodeType,
    TaskConfig, Trigger, ValidationReport, Variable, WorkflowDefinition,
};
pub use monitor::{
    AlertKind, ExecutionMetrics, ExecutionMonitor, ExecutionSource, ExecutionSummary,
    MonitorAlert, MonitorError,
};
pub use retry::RetryPolicy;
pub use service::Orchestrator;

use flowgate_agents::CoordinationError;
use flowgate_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Workflow validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Execution {execution_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Execution {0} is still active")]
    NotTerminal(String),

    #[error("Node {node_id} failed: {reason}")]
    NodeExecution { node_id: String, reason: String },

    #[error("Approval request {0} expired without a decision")]
    ApprovalTimeout(String),

    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

//! Agent coordination for Flowgate
//!
//! This crate tracks the pool of workers and routes individual workflow steps
//! to them:
//! - [`agent`]: agent records, built once with their full capability set
//! - [`registry`]: registration, heartbeats, health checks and load accounting
//! - [`coordinator`]: capability matching, queueing and failure reassignment
//! - [`worker`]: the worker-facing seam and an in-process worker pool

pub mod agent;
pub mod coordinator;
pub mod registry;
pub mod worker;

pub use agent::{Agent, AgentBuilder, AgentHealth};
pub use coordinator::{
    Assignment, InFlightTask, InterventionHandler, QueuedTask, TaskCoordinator, TaskRequest,
    TaskResult,
};
pub use registry::AgentRegistry;
pub use worker::{
    AnalysisService, AnalysisStepHandler, EchoHandler, LocalWorkerPool, StepHandler, WorkerClient,
    WorkerError,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),

    #[error("No agent with capability '{capability}' became available within {waited_secs:.1}s")]
    NoCapableAgent {
        capability: String,
        waited_secs: f64,
        /// Manual-intervention request opened for the task
        intervention: Option<String>,
    },

    #[error("Agent {failed_agent} failed and no alternate agent has capability '{capability}'")]
    NoAlternateAgent {
        capability: String,
        failed_agent: String,
        intervention: Option<String>,
    },

    #[error("Task {task_id} timed out after {timeout_secs:.1}s")]
    Timeout {
        task_id: String,
        timeout_secs: f64,
    },

    #[error("Step failed on agent {agent_id}: {message}")]
    StepFailed {
        agent_id: String,
        message: String,
    },
}

impl CoordinationError {
    /// Id of the manual-intervention request raised when the task could not
    /// be placed
    pub fn intervention_request(&self) -> Option<&str> {
        match self {
            Self::NoCapableAgent { intervention, .. }
            | Self::NoAlternateAgent { intervention, .. } => intervention.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

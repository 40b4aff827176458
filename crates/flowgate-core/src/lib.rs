//! Core building blocks shared by every Flowgate crate.
//!
//! - [`config`]: layered orchestrator configuration (file + environment)
//! - [`events`]: coordination events, envelopes and the in-process event bus

pub mod config;
pub mod events;

pub use config::{
    AgentSeedConfig, ApprovalConfig, ApprovalTimeouts, CoordinatorConfig, EngineConfig,
    EventBusConfig, MonitorConfig, OrchestratorConfig, RegistryConfig,
};
pub use events::{
    CoordinationEvent, CoordinationEventType, Envelope, EventBus, Scope, Subscription, topics,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event bus error: {0}")]
    EventBus(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

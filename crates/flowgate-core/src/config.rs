use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::{CoreError, Result};

/// Main orchestrator configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub coordinator: CoordinatorConfig,
    pub engine: EngineConfig,
    pub approval: ApprovalConfig,
    pub monitor: MonitorConfig,
    pub events: EventBusConfig,
    /// Agents registered at startup by in-process worker pools
    pub agents: Vec<AgentSeedConfig>,
}

impl OrchestratorConfig {
    /// Load configuration from environment variables
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from_env("FLOWGATE")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder().add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("FLOWGATE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let approval = &self.approval;
        for (name, value) in [
            ("approval.high_risk_threshold", approval.high_risk_threshold),
            ("approval.critical_risk_threshold", approval.critical_risk_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if approval.high_risk_threshold > approval.critical_risk_threshold {
            return Err(CoreError::InvalidConfig(
                "approval.high_risk_threshold must not exceed approval.critical_risk_threshold"
                    .to_string(),
            ));
        }

        if approval.business_hours_start >= approval.business_hours_end
            || approval.business_hours_end > 24
        {
            return Err(CoreError::InvalidConfig(format!(
                "invalid business hours window {}..{}",
                approval.business_hours_start, approval.business_hours_end
            )));
        }

        if self.registry.heartbeat_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "registry.heartbeat_timeout_secs must be positive".to_string(),
            ));
        }

        if self.events.subscriber_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "events.subscriber_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Agent registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub health_check_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub default_max_concurrent_tasks: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            default_max_concurrent_tasks: 1,
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Task coordinator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a task waits in the queue for a capable agent
    pub queue_wait_secs: f64,
    /// Action name to capability mapping; unmapped actions require a
    /// capability with the same name as the action
    pub action_capabilities: HashMap<String, String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_wait_secs: 60.0,
            action_capabilities: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs_f64(self.queue_wait_secs.max(0.0))
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_task_timeout_secs: f64,
    pub default_retry_delay_secs: f64,
    /// Upper bound on how often one node may run inside a single execution
    pub max_node_visits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_secs: 300.0,
            default_retry_delay_secs: 1.0,
            max_node_visits: 100,
        }
    }
}

/// Approval gate configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub high_risk_threshold: f64,
    pub critical_risk_threshold: f64,
    pub financial_impact_threshold: f64,
    /// Business hours in UTC, Monday to Friday, `[start, end)`
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    pub max_escalation_level: u32,
    pub history_limit: usize,
    pub learning_min_samples: usize,
    pub sweep_interval_secs: u64,
    pub timeouts: ApprovalTimeouts,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            high_risk_threshold: 0.8,
            critical_risk_threshold: 0.9,
            financial_impact_threshold: 10_000.0,
            business_hours_start: 9,
            business_hours_end: 17,
            max_escalation_level: 2,
            history_limit: 1000,
            learning_min_samples: 5,
            sweep_interval_secs: 30,
            timeouts: ApprovalTimeouts::default(),
        }
    }
}

/// Per approval type timeouts, in minutes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalTimeouts {
    pub security_action: u64,
    pub data_access: u64,
    pub deployment: u64,
    pub manual_intervention: u64,
    pub general: u64,
    pub service_delivery: u64,
    pub financial_transaction: u64,
}

impl Default for ApprovalTimeouts {
    fn default() -> Self {
        Self {
            security_action: 15,
            data_access: 30,
            deployment: 60,
            manual_intervention: 60,
            general: 60,
            service_delivery: 120,
            financial_transaction: 240,
        }
    }
}

/// Execution monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: f64,
    pub stall_threshold_secs: f64,
    pub stall_alert_cooldown_secs: f64,
    pub sweep_interval_secs: f64,
    pub long_running_threshold_secs: f64,
    pub history_limit: usize,
    pub top_errors: usize,
    pub error_message_max_len: usize,
    /// Distinct error groups retained; the rarest is dropped beyond this
    pub max_error_groups: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5.0,
            stall_threshold_secs: 60.0,
            stall_alert_cooldown_secs: 300.0,
            sweep_interval_secs: 30.0,
            long_running_threshold_secs: 3600.0,
            history_limit: 100,
            top_errors: 10,
            error_message_max_len: 100,
            max_error_groups: 200,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.01))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_secs.max(0.01))
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Envelopes retained per subscriber before the oldest are dropped
    pub subscriber_capacity: usize,
    /// Coordination events retained for history queries
    pub history_limit: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            history_limit: 1000,
        }
    }
}

/// Agent declared in configuration and registered at startup
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSeedConfig {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
    /// Simulated step latency for in-process demo workers
    #[serde(default)]
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.registry.health_check_interval_secs, 10);
        assert_eq!(config.registry.heartbeat_timeout_secs, 30);
        assert_eq!(config.approval.high_risk_threshold, 0.8);
        assert_eq!(config.approval.critical_risk_threshold, 0.9);
        assert_eq!(config.monitor.poll_interval_secs, 5.0);
        assert_eq!(config.monitor.stall_threshold_secs, 60.0);
        assert_eq!(config.monitor.long_running_threshold_secs, 3600.0);
        assert!(config.agents.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = OrchestratorConfig::default();
        config.approval.high_risk_threshold = 0.95;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.approval.critical_risk_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_business_hours_rejected() {
        let mut config = OrchestratorConfig::default();
        config.approval.business_hours_start = 18;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[registry]
heartbeat_timeout_secs = 45

[approval]
high_risk_threshold = 0.7

[coordinator.action_capabilities]
isolate_host = "security"

[[agents]]
id = "sec-1"
capabilities = ["security"]
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = OrchestratorConfig::load_from_file(&path).unwrap();

        assert_eq!(config.registry.heartbeat_timeout_secs, 45);
        assert_eq!(config.registry.health_check_interval_secs, 10);
        assert_eq!(config.approval.high_risk_threshold, 0.7);
        assert_eq!(
            config.coordinator.action_capabilities.get("isolate_host"),
            Some(&"security".to_string())
        );
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].capabilities, vec!["security".to_string()]);
    }
}

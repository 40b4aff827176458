//! Agent records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Health of an agent as seen by the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// Heartbeats are current
    Healthy,
    /// Heartbeat is stale or a dispatched call failed
    Unhealthy,
}

/// A worker known to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent ID
    pub id: String,
    /// Capabilities advertised at registration
    pub capabilities: BTreeSet<String>,
    /// Current health
    pub health: AgentHealth,
    /// Last heartbeat received
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks currently dispatched to this agent
    pub in_flight: u32,
    /// Tasks this agent accepts at once
    pub max_concurrent_tasks: u32,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
    /// Free-form labels
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Registration order, used to break load ties
    #[serde(skip)]
    pub(crate) registration_seq: u64,
}

impl Agent {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Healthy and below its concurrency limit
    pub fn is_available(&self) -> bool {
        self.health == AgentHealth::Healthy && self.in_flight < self.max_concurrent_tasks
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    /// Seconds since the last heartbeat
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_heartbeat).num_milliseconds() as f64 / 1000.0
    }
}

/// Builds an [`Agent`] with its complete capability set.
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    id: String,
    capabilities: BTreeSet<String>,
    max_concurrent_tasks: u32,
    metadata: HashMap<String, String>,
}

impl AgentBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            max_concurrent_tasks: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Agent {
        let now = Utc::now();
        Agent {
            id: self.id,
            capabilities: self.capabilities,
            health: AgentHealth::Healthy,
            last_heartbeat: now,
            in_flight: 0,
            max_concurrent_tasks: self.max_concurrent_tasks,
            registered_at: now,
            metadata: self.metadata,
            registration_seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_composes_capabilities() {
        let agent = AgentBuilder::new("sec-1")
            .capability("security")
            .capabilities(["triage", "forensics"])
            .max_concurrent_tasks(3)
            .metadata("region", "eu")
            .build();

        assert_eq!(agent.id, "sec-1");
        assert!(agent.has_capability("security"));
        assert!(agent.has_capability("forensics"));
        assert!(!agent.has_capability("billing"));
        assert_eq!(agent.max_concurrent_tasks, 3);
        assert_eq!(agent.metadata.get("region"), Some(&"eu".to_string()));
        assert!(agent.is_available());
        assert!(agent.is_idle());
    }

    #[test]
    fn test_availability_respects_capacity_and_health() {
        let mut agent = AgentBuilder::new("a").capability("x").build();
        agent.in_flight = 1;
        assert!(!agent.is_available());

        agent.in_flight = 0;
        agent.health = AgentHealth::Unhealthy;
        assert!(!agent.is_available());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let agent = AgentBuilder::new("a").max_concurrent_tasks(0).build();
        assert_eq!(agent.max_concurrent_tasks, 1);
    }
}

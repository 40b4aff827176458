//! Agent registry with heartbeat tracking and load accounting.
//!
//! All selection and in-flight counter updates happen inside one write lock so
//! that two concurrent assignments can never both claim the last free slot of
//! an agent.

use chrono::{DateTime, Utc};
use flowgate_core::{CoordinationEvent, CoordinationEventType, EventBus, RegistryConfig};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentHealth};
use crate::{CoordinationError, Result};

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
    next_seq: AtomicU64,
    availability: Notify,
    bus: EventBus,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig, bus: EventBus) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            availability: Notify::new(),
            bus,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an agent. Registering an existing id replaces its capability
    /// set and refreshes its heartbeat while keeping its load and position.
    pub fn register(&self, mut agent: Agent) -> Result<()> {
        if agent.id.trim().is_empty() {
            return Err(CoordinationError::InvalidAgent(
                "agent id must not be empty".to_string(),
            ));
        }

        let agent_id = agent.id.clone();
        let capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
        {
            let mut agents = self.agents.write();
            match agents.get(&agent_id) {
                Some(existing) => {
                    agent.registration_seq = existing.registration_seq;
                    agent.in_flight = existing.in_flight;
                    agent.registered_at = existing.registered_at;
                }
                None => {
                    agent.registration_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                }
            }
            agent.health = AgentHealth::Healthy;
            agent.last_heartbeat = Utc::now();
            agents.insert(agent_id.clone(), agent);
        }

        info!(
            agent_id = %agent_id,
            capabilities = ?capabilities,
            "Agent registered"
        );

        self.bus.publish_coordination(
            CoordinationEvent::new(
                CoordinationEventType::AgentRegistered,
                serde_json::json!({ "capabilities": capabilities }),
            )
            .with_source(&agent_id),
        );
        self.availability.notify_waiters();

        Ok(())
    }

    /// Record a heartbeat, restoring an unhealthy agent
    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let recovered = {
            let mut agents = self.agents.write();
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.to_string()))?;

            agent.last_heartbeat = Utc::now();
            let recovered = agent.health == AgentHealth::Unhealthy;
            agent.health = AgentHealth::Healthy;
            recovered
        };

        if recovered {
            info!(agent_id = %agent_id, "Agent recovered");
            self.bus.publish_coordination(
                CoordinationEvent::new(CoordinationEventType::AgentRecovered, serde_json::json!({}))
                    .with_source(agent_id),
            );
            self.availability.notify_waiters();
        } else {
            debug!(agent_id = %agent_id, "Heartbeat received");
        }

        Ok(())
    }

    pub fn unregister(&self, agent_id: &str) -> Result<Agent> {
        let agent = self
            .agents
            .write()
            .remove(agent_id)
            .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.to_string()))?;

        info!(
            agent_id = %agent_id,
            in_flight = agent.in_flight,
            "Agent unregistered"
        );

        self.bus.publish_coordination(
            CoordinationEvent::new(
                CoordinationEventType::AgentUnregistered,
                serde_json::json!({ "in_flight": agent.in_flight }),
            )
            .with_source(agent_id),
        );

        Ok(agent)
    }

    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().get(agent_id).cloned()
    }

    /// All agents in registration order
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().values().cloned().collect();
        agents.sort_by_key(|agent| agent.registration_seq);
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Union of all advertised capabilities
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.agents
            .read()
            .values()
            .flat_map(|agent| agent.capabilities.iter().cloned())
            .collect()
    }

    /// Whether any registered agent advertises the capability, healthy or not
    pub fn has_capability(&self, capability: &str) -> bool {
        self.agents
            .read()
            .values()
            .any(|agent| agent.has_capability(capability))
    }

    /// Mark agents whose heartbeat is older than the timeout as unhealthy.
    /// Returns the ids that changed state on this pass.
    pub fn check_health(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout_secs = self.config.heartbeat_timeout_secs as f64;
        let mut stale = Vec::new();

        {
            let mut agents = self.agents.write();
            for agent in agents.values_mut() {
                if agent.health == AgentHealth::Healthy
                    && agent.heartbeat_age_secs(now) > timeout_secs
                {
                    agent.health = AgentHealth::Unhealthy;
                    stale.push((agent.id.clone(), agent.heartbeat_age_secs(now)));
                }
            }
        }

        for (agent_id, age_secs) in &stale {
            warn!(
                agent_id = %agent_id,
                heartbeat_age_secs = age_secs,
                "Agent heartbeat is stale"
            );
            self.bus.publish_coordination(
                CoordinationEvent::new(
                    CoordinationEventType::AgentUnhealthy,
                    serde_json::json!({
                        "reason": "heartbeat_timeout",
                        "heartbeat_age_secs": age_secs,
                    }),
                )
                .with_source(agent_id),
            );
        }

        stale.into_iter().map(|(agent_id, _)| agent_id).collect()
    }

    /// Mark an agent unhealthy after a failed call. Returns true if the agent
    /// was healthy before.
    pub fn mark_unhealthy(&self, agent_id: &str, reason: &str) -> bool {
        let changed = {
            let mut agents = self.agents.write();
            match agents.get_mut(agent_id) {
                Some(agent) if agent.health == AgentHealth::Healthy => {
                    agent.health = AgentHealth::Unhealthy;
                    true
                }
                _ => false,
            }
        };

        if changed {
            warn!(agent_id = %agent_id, reason = %reason, "Agent marked unhealthy");
            self.bus.publish_coordination(
                CoordinationEvent::new(
                    CoordinationEventType::AgentUnhealthy,
                    serde_json::json!({ "reason": reason }),
                )
                .with_source(agent_id),
            );
        }

        changed
    }

    /// Pick the available agent with the capability and the fewest in-flight
    /// tasks (ties broken by registration order) and claim a slot on it.
    pub fn reserve(&self, capability: &str, exclude: &HashSet<String>) -> Option<String> {
        let mut agents = self.agents.write();
        let agent = agents
            .values_mut()
            .filter(|agent| {
                agent.is_available()
                    && agent.has_capability(capability)
                    && !exclude.contains(&agent.id)
            })
            .min_by_key(|agent| (agent.in_flight, agent.registration_seq))?;

        agent.in_flight += 1;
        Some(agent.id.clone())
    }

    /// Claim a slot on a specific agent if it is available and capable
    pub fn reserve_preferred(&self, agent_id: &str, capability: &str) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(agent_id) {
            Some(agent) if agent.is_available() && agent.has_capability(capability) => {
                agent.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Give back a slot claimed by [`reserve`](Self::reserve)
    pub fn release(&self, agent_id: &str) {
        if let Some(agent) = self.agents.write().get_mut(agent_id) {
            agent.in_flight = agent.in_flight.saturating_sub(1);
        }
        self.availability.notify_waiters();
    }

    /// Resolves the next time an agent may have become available
    pub fn availability_changed(&self) -> Notified<'_> {
        self.availability.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentBuilder;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(RegistryConfig::default(), EventBus::default())
    }

    fn no_exclusions() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_register_and_list_in_order() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("b").capability("x").build())
            .unwrap();
        registry
            .register(AgentBuilder::new("a").capability("y").build())
            .unwrap();

        let ids: Vec<_> = registry.list().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(registry.has_capability("y"));
        assert_eq!(registry.capabilities().len(), 2);
    }

    #[test]
    fn test_empty_id_rejected() {
        let registry = registry();
        let result = registry.register(AgentBuilder::new("  ").build());
        assert!(matches!(result, Err(CoordinationError::InvalidAgent(_))));
    }

    #[test]
    fn test_reserve_prefers_lowest_load_then_registration_order() {
        let registry = registry();
        for id in ["first", "second", "third"] {
            registry
                .register(
                    AgentBuilder::new(id)
                        .capability("x")
                        .max_concurrent_tasks(2)
                        .build(),
                )
                .unwrap();
        }

        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("first"));
        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("second"));
        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("third"));
        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("first"));

        registry.release("third");
        registry.release("third");
        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("third"));
    }

    #[test]
    fn test_reserve_never_returns_incapable_agent() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();

        assert!(registry.reserve("c", &no_exclusions()).is_none());
        assert_eq!(registry.get("a").unwrap().in_flight, 0);
    }

    #[test]
    fn test_reserve_respects_exclusions_and_capacity() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();
        registry
            .register(AgentBuilder::new("b").capability("x").build())
            .unwrap();

        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        assert_eq!(registry.reserve("x", &exclude).as_deref(), Some("b"));
        assert!(registry.reserve("x", &exclude).is_none());
        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("a"));
        assert!(registry.reserve("x", &no_exclusions()).is_none());
    }

    #[test]
    fn test_reserve_preferred() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();

        assert!(!registry.reserve_preferred("a", "y"));
        assert!(registry.reserve_preferred("a", "x"));
        assert!(!registry.reserve_preferred("a", "x"));
        assert!(!registry.reserve_preferred("missing", "x"));
    }

    #[test]
    fn test_health_check_marks_stale_agents() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();
        registry
            .register(AgentBuilder::new("b").capability("x").build())
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(31);
        let mut stale = registry.check_health(later);
        stale.sort();
        assert_eq!(stale, vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().health, AgentHealth::Unhealthy);

        // Already unhealthy agents are not reported twice
        assert!(registry.check_health(later).is_empty());
        assert!(registry.reserve("x", &no_exclusions()).is_none());

        registry.heartbeat("a").unwrap();
        assert_eq!(registry.get("a").unwrap().health, AgentHealth::Healthy);
        assert_eq!(registry.reserve("x", &no_exclusions()).as_deref(), Some("a"));
    }

    #[test]
    fn test_fresh_heartbeat_stays_healthy() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();
        assert!(registry.check_health(Utc::now()).is_empty());
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let registry = registry();
        assert!(matches!(
            registry.heartbeat("ghost"),
            Err(CoordinationError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_reregister_keeps_load() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();
        assert!(registry.reserve_preferred("a", "x"));

        registry
            .register(AgentBuilder::new("a").capabilities(["x", "y"]).build())
            .unwrap();
        let agent = registry.get("a").unwrap();
        assert_eq!(agent.in_flight, 1);
        assert!(agent.has_capability("y"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_publishes_event() {
        let bus = EventBus::default();
        let registry = AgentRegistry::new(RegistryConfig::default(), bus.clone());
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();
        registry.unregister("a").unwrap();

        assert!(registry.is_empty());
        let kinds: Vec<_> = bus
            .history_for_agent("a")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                CoordinationEventType::AgentRegistered,
                CoordinationEventType::AgentUnregistered
            ]
        );
    }

    #[test]
    fn test_mark_unhealthy_only_once() {
        let registry = registry();
        registry
            .register(AgentBuilder::new("a").capability("x").build())
            .unwrap();
        assert!(registry.mark_unhealthy("a", "connection refused"));
        assert!(!registry.mark_unhealthy("a", "connection refused"));
        assert!(!registry.mark_unhealthy("missing", "connection refused"));
    }
}

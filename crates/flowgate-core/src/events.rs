//! Coordination events and the in-process publish/subscribe bus.
//!
//! Every component announces state changes as an [`Envelope`] on the
//! [`EventBus`]. Subscribers pick a [`Scope`] (one execution, one workflow or
//! everything) and receive a filtered view. Each subscriber reads from its own
//! bounded ring: a slow subscriber loses its oldest envelopes instead of
//! slowing down publishers.

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;
use uuid::Uuid;

use crate::config::EventBusConfig;

/// Envelope topics
pub mod topics {
    pub const EXECUTION: &str = "execution";
    pub const NODE: &str = "node";
    pub const APPROVAL: &str = "approval";
    pub const COORDINATION: &str = "coordination";
    pub const MONITOR: &str = "monitor";
}

/// Kind of a coordination event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationEventType {
    AgentRegistered,
    AgentUnregistered,
    AgentUnhealthy,
    AgentRecovered,
    TaskAssigned,
    TaskQueued,
    TaskCompleted,
    TaskFailed,
    TaskReassigned,
    SystemAlert,
}

impl CoordinationEventType {
    /// Envelope type string for this event kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRegistered => "agent_registered",
            Self::AgentUnregistered => "agent_unregistered",
            Self::AgentUnhealthy => "agent_unhealthy",
            Self::AgentRecovered => "agent_recovered",
            Self::TaskAssigned => "task_assigned",
            Self::TaskQueued => "task_queued",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskReassigned => "task_reassigned",
            Self::SystemAlert => "system_alert",
        }
    }
}

/// An event exchanged between the coordinator, the registry and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub id: Uuid,
    pub event_type: CoordinationEventType,
    pub source_agent: Option<String>,
    pub target_agent: Option<String>,
    /// Execution the event relates to, if any
    pub execution_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CoordinationEvent {
    pub fn new(event_type: CoordinationEventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source_agent: None,
            target_agent: None,
            execution_id: None,
            workflow_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent = Some(agent_id.into());
        self
    }

    pub fn with_target(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent = Some(agent_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    fn involves(&self, agent_id: &str) -> bool {
        self.source_agent.as_deref() == Some(agent_id)
            || self.target_agent.as_deref() == Some(agent_id)
    }
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Envelopes tagged with this execution id
    Execution(String),
    /// Envelopes tagged with this workflow id
    Workflow(String),
    /// Everything
    All,
}

impl Scope {
    /// Parse `*`, `workflow:<id>`, `execution:<id>` or a bare execution id.
    pub fn parse(value: &str) -> Self {
        if value == "*" {
            Scope::All
        } else if let Some(id) = value.strip_prefix("workflow:") {
            Scope::Workflow(id.to_string())
        } else if let Some(id) = value.strip_prefix("execution:") {
            Scope::Execution(id.to_string())
        } else {
            Scope::Execution(value.to_string())
        }
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Scope::parse(value)
    }
}

/// The unit delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new<T: Serialize>(event_type: impl Into<String>, topic: impl Into<String>, payload: T) -> Self {
        Self {
            event_type: event_type.into(),
            topic: topic.into(),
            execution_id: None,
            workflow_id: None,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }

    /// Tag the envelope with the execution and workflow it belongs to
    pub fn for_execution(
        mut self,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        self.execution_id = Some(execution_id.into());
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        match scope {
            Scope::All => true,
            Scope::Execution(id) => self.execution_id.as_deref() == Some(id.as_str()),
            Scope::Workflow(id) => self.workflow_id.as_deref() == Some(id.as_str()),
        }
    }
}

struct BusInner {
    tx: broadcast::Sender<Envelope>,
    history: Mutex<VecDeque<CoordinationEvent>>,
    history_limit: usize,
}

/// In-process event bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: &EventBusConfig) -> Self {
        Self::with_capacity(config.subscriber_capacity, config.history_limit)
    }

    pub fn with_capacity(subscriber_capacity: usize, history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                history: Mutex::new(VecDeque::new()),
                history_limit,
            }),
        }
    }

    /// Publish an envelope. Never blocks; returns the number of subscribers
    /// that will see it before scope filtering.
    pub fn publish(&self, envelope: Envelope) -> usize {
        // No receivers is not an error
        self.inner.tx.send(envelope).unwrap_or(0)
    }

    /// Record a coordination event in history and publish it.
    pub fn publish_coordination(&self, event: CoordinationEvent) -> usize {
        let mut envelope = Envelope::new(event.event_type.as_str(), topics::COORDINATION, &event);
        envelope.execution_id = event.execution_id.clone();
        envelope.workflow_id = event.workflow_id.clone();
        envelope.timestamp = event.timestamp;

        {
            let mut history = self.inner.history.lock();
            history.push_back(event);
            while history.len() > self.inner.history_limit {
                history.pop_front();
            }
        }

        self.publish(envelope)
    }

    pub fn subscribe(&self, scope: impl Into<Scope>) -> Subscription {
        Subscription {
            scope: scope.into(),
            rx: self.inner.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Most recent coordination events, oldest first
    pub fn history(&self, limit: usize) -> Vec<CoordinationEvent> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Coordination events in which the agent is source or target
    pub fn history_for_agent(&self, agent_id: &str) -> Vec<CoordinationEvent> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|event| event.involves(agent_id))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventBusConfig::default())
    }
}

/// A scoped view onto the bus.
pub struct Subscription {
    scope: Scope,
    rx: broadcast::Receiver<Envelope>,
    dropped: u64,
}

impl Subscription {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Envelopes this subscriber lost because it fell behind
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next envelope in scope. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.matches(&self.scope) => return Some(envelope),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next envelope in scope if one is already buffered
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.matches(&self.scope) => return Some(envelope),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered in scope
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = Envelope> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|envelope| (envelope, subscription))
        })
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(
            scope = ?self.scope,
            skipped,
            "Subscriber fell behind, oldest envelopes dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn execution_envelope(event_type: &str, execution_id: &str, workflow_id: &str) -> Envelope {
        Envelope::new(event_type, topics::EXECUTION, serde_json::json!({}))
            .for_execution(execution_id, workflow_id)
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(Scope::parse("*"), Scope::All);
        assert_eq!(Scope::parse("workflow:wf-1"), Scope::Workflow("wf-1".to_string()));
        assert_eq!(Scope::parse("execution:ex-1"), Scope::Execution("ex-1".to_string()));
        assert_eq!(Scope::parse("ex-2"), Scope::Execution("ex-2".to_string()));
    }

    #[test]
    fn test_envelope_serializes_type_field() {
        let envelope = execution_envelope("execution_status", "ex-1", "wf-1");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "execution_status");
        assert_eq!(value["topic"], "execution");
        assert_eq!(value["execution_id"], "ex-1");
    }

    #[tokio::test]
    async fn test_scoped_delivery() {
        let bus = EventBus::default();
        let mut by_execution = bus.subscribe("ex-1");
        let mut by_workflow = bus.subscribe("workflow:wf-2");
        let mut everything = bus.subscribe("*");

        bus.publish(execution_envelope("a", "ex-1", "wf-1"));
        bus.publish(execution_envelope("b", "ex-2", "wf-2"));
        bus.publish(Envelope::new("c", topics::MONITOR, serde_json::json!({})));

        let seen: Vec<_> = by_execution.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(seen, vec!["a"]);

        let seen: Vec<_> = by_workflow.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(seen, vec!["b"]);

        assert_eq!(everything.drain().len(), 3);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::with_capacity(4, 10);
        let mut slow = bus.subscribe("*");

        for i in 0..10 {
            bus.publish(Envelope::new(format!("e{}", i), topics::EXECUTION, serde_json::json!({})));
        }

        let received: Vec<_> = slow.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(received, vec!["e6", "e7", "e8", "e9"]);
        assert_eq!(slow.dropped_count(), 6);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(Envelope::new("x", topics::NODE, serde_json::json!({}))), 0);
    }

    #[test]
    fn test_coordination_history_is_bounded() {
        let bus = EventBus::with_capacity(16, 3);

        for i in 0..5 {
            bus.publish_coordination(
                CoordinationEvent::new(
                    CoordinationEventType::TaskAssigned,
                    serde_json::json!({ "n": i }),
                )
                .with_target(format!("agent-{}", i)),
            );
        }

        let history = bus.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload["n"], 2);
        assert_eq!(bus.history(1)[0].payload["n"], 4);
        assert_eq!(bus.history_for_agent("agent-4").len(), 1);
        assert!(bus.history_for_agent("agent-0").is_empty());
    }

    #[tokio::test]
    async fn test_coordination_events_reach_subscribers() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe("*");

        bus.publish_coordination(
            CoordinationEvent::new(CoordinationEventType::SystemAlert, serde_json::json!({}))
                .with_execution("ex-9"),
        );

        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.event_type, "system_alert");
        assert_eq!(envelope.topic, topics::COORDINATION);
        assert_eq!(envelope.execution_id.as_deref(), Some("ex-9"));
    }

    #[tokio::test]
    async fn test_coordination_events_reach_workflow_scope() {
        let bus = EventBus::default();
        let mut workflow = bus.subscribe("workflow:wf-3");
        let mut other = bus.subscribe(Scope::Workflow("wf-4".to_string()));

        bus.publish_coordination(
            CoordinationEvent::new(CoordinationEventType::TaskQueued, serde_json::json!({}))
                .with_execution("ex-3")
                .with_workflow("wf-3"),
        );

        let envelope = workflow.recv().await.unwrap();
        assert_eq!(envelope.event_type, "task_queued");
        assert_eq!(envelope.workflow_id.as_deref(), Some("wf-3"));
        assert!(other.drain().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_stream() {
        let bus = EventBus::default();
        let stream = bus.subscribe("ex-1").into_stream();

        bus.publish(execution_envelope("first", "ex-1", "wf"));
        bus.publish(execution_envelope("second", "ex-1", "wf"));

        let received: Vec<_> = stream.take(2).map(|e| e.event_type).collect().await;
        assert_eq!(received, vec!["first", "second"]);
    }
}

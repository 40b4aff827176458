//! Execution monitoring.
//!
//! A watchdog per execution polls its snapshot for stalls and overdue nodes.
//! A periodic sweep flags long running executions. Finished executions feed
//! rolling metrics. Alerts are advisory: the engine's own timeouts are what
//! actually stop work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgate_core::{topics, Envelope, EventBus, MonitorConfig};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::execution::{ExecutionStatus, WorkflowExecution};

/// Consecutive missing snapshots before a watchdog gives up
const MAX_MISSING_SNAPSHOTS: u32 = 3;

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("valid uuid regex")
});

static NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?").expect("valid number regex"));

/// Read access to executions for monitoring
#[async_trait]
pub trait ExecutionSource: Send + Sync {
    async fn snapshot(&self, execution_id: &str) -> Option<WorkflowExecution>;

    /// Executions that have not reached a terminal status
    async fn active_executions(&self) -> Vec<WorkflowExecution>;
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StalledExecution,
    NodeTimeout,
    LongRunningExecution,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StalledExecution => "stalled_execution",
            Self::NodeTimeout => "node_timeout",
            Self::LongRunningExecution => "long_running_execution",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorAlert {
    pub id: String,
    pub kind: AlertKind,
    pub execution_id: String,
    pub workflow_id: String,
    pub node_id: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl MonitorAlert {
    fn new(kind: AlertKind, execution: &WorkflowExecution, message: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            node_id: None,
            message,
            raised_at: Utc::now(),
        }
    }

    fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// A finished execution as kept in the metrics history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_executions: u64,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Completed share of finished executions
    pub success_rate: f64,
    /// Over completed executions only
    pub average_duration_secs: Option<f64>,
    /// Most recent first
    pub recent: Vec<ExecutionSummary>,
    pub top_errors: Vec<ErrorCount>,
}

#[derive(Default)]
struct MonitorState {
    total: u64,
    watching: HashSet<String>,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    completed_duration_secs: f64,
    timed_completions: u64,
    history: VecDeque<ExecutionSummary>,
    errors: HashMap<String, usize>,
    alerts: VecDeque<MonitorAlert>,
    long_running: HashSet<String>,
}

/// Per watchdog bookkeeping
struct WatchState {
    progress: f64,
    progress_changed_at: Instant,
    last_stall_alert: Option<Instant>,
    /// Node attempts already reported as overdue, by record index
    overdue_nodes: HashSet<usize>,
    missing: u32,
}

impl WatchState {
    fn new() -> Self {
        Self {
            progress: 0.0,
            progress_changed_at: Instant::now(),
            last_stall_alert: None,
            overdue_nodes: HashSet::new(),
            missing: 0,
        }
    }
}

/// Watches executions and aggregates their outcomes
#[derive(Clone)]
pub struct ExecutionMonitor {
    source: Arc<dyn ExecutionSource>,
    bus: EventBus,
    config: MonitorConfig,
    state: Arc<RwLock<MonitorState>>,
}

impl ExecutionMonitor {
    pub fn new(source: Arc<dyn ExecutionSource>, bus: EventBus, config: MonitorConfig) -> Self {
        Self {
            source,
            bus,
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
        }
    }

    /// Start a watchdog for an execution. Returns `None` when one is
    /// already running for it.
    pub fn watch(&self, execution_id: &str, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.write();
            if !state.watching.insert(execution_id.to_string()) {
                return None;
            }
            state.total += 1;
        }

        debug!(execution_id = %execution_id, "Watchdog started");
        let monitor = self.clone();
        let execution_id = execution_id.to_string();
        Some(tokio::spawn(async move {
            monitor.run_watchdog(execution_id, shutdown).await
        }))
    }

    async fn run_watchdog(self, execution_id: String, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watch = WatchState::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.check(&execution_id, &mut watch).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Watchdog iteration failed");
                    if watch.missing >= MAX_MISSING_SNAPSHOTS {
                        break;
                    }
                }
            }
        }

        self.state.write().watching.remove(&execution_id);
        debug!(execution_id = %execution_id, "Watchdog stopped");
    }

    /// One watchdog iteration. Returns true once the execution is terminal.
    async fn check(&self, execution_id: &str, watch: &mut WatchState) -> Result<bool, MonitorError> {
        let Some(execution) = self.source.snapshot(execution_id).await else {
            watch.missing += 1;
            return Err(MonitorError::ExecutionNotFound(execution_id.to_string()));
        };
        watch.missing = 0;

        if execution.status.is_terminal() {
            self.record_finished(&execution);
            return Ok(true);
        }

        let now = Instant::now();
        let progress_changed = (execution.progress - watch.progress).abs() > f64::EPSILON;
        let idle_by_request = matches!(
            execution.status,
            ExecutionStatus::Paused | ExecutionStatus::WaitingApproval
        );

        if progress_changed || idle_by_request {
            // Waiting on an operator is not a stall; the clock restarts afterwards
            watch.progress = execution.progress;
            watch.progress_changed_at = now;
        } else {
            let threshold = Duration::from_secs_f64(self.config.stall_threshold_secs.max(0.0));
            let cooldown = Duration::from_secs_f64(self.config.stall_alert_cooldown_secs.max(0.0));
            let stalled_for = now.saturating_duration_since(watch.progress_changed_at);
            let cooled_down = watch
                .last_stall_alert
                .map_or(true, |last| now.saturating_duration_since(last) >= cooldown);

            if stalled_for >= threshold && cooled_down {
                watch.last_stall_alert = Some(now);
                self.raise(MonitorAlert::new(
                    AlertKind::StalledExecution,
                    &execution,
                    format!(
                        "progress stuck at {:.1}% for {:.0}s",
                        execution.progress,
                        stalled_for.as_secs_f64()
                    ),
                ));
            }
        }

        let wall_clock = Utc::now();
        for (index, record) in execution.running_nodes() {
            let (Some(timeout_secs), Some(elapsed)) =
                (record.timeout_secs, record.elapsed_secs(wall_clock))
            else {
                continue;
            };
            if elapsed > timeout_secs && watch.overdue_nodes.insert(index) {
                self.raise(
                    MonitorAlert::new(
                        AlertKind::NodeTimeout,
                        &execution,
                        format!(
                            "node {} running for {:.1}s, past its {:.1}s timeout",
                            record.node_id, elapsed, timeout_secs
                        ),
                    )
                    .for_node(&record.node_id),
                );
            }
        }

        Ok(false)
    }

    /// Flag active executions over the long running threshold, once each
    pub async fn sweep(&self) -> Vec<MonitorAlert> {
        let active = self.source.active_executions().await;
        let threshold = self.config.long_running_threshold_secs;

        let mut raised = Vec::new();
        {
            let mut state = self.state.write();
            let active_ids: HashSet<&str> = active.iter().map(|e| e.id.as_str()).collect();
            state.long_running.retain(|id| active_ids.contains(id.as_str()));

            for execution in &active {
                let Some(duration) = execution.duration_secs() else {
                    continue;
                };
                if duration > threshold && state.long_running.insert(execution.id.clone()) {
                    raised.push(MonitorAlert::new(
                        AlertKind::LongRunningExecution,
                        execution,
                        format!(
                            "execution running for {:.0}s, over the {:.0}s threshold",
                            duration, threshold
                        ),
                    ));
                }
            }
        }

        for alert in &raised {
            self.raise(alert.clone());
        }
        raised
    }

    /// Periodic sweep until `shutdown` is cancelled
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let interval = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs_f64(), "Execution monitor sweep started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Execution monitor sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let raised = monitor.sweep().await;
                        if !raised.is_empty() {
                            debug!(count = raised.len(), "Long running executions flagged");
                        }
                    }
                }
            }
        })
    }

    fn raise(&self, alert: MonitorAlert) {
        warn!(
            execution_id = %alert.execution_id,
            kind = %alert.kind,
            node_id = alert.node_id.as_deref().unwrap_or(""),
            message = %alert.message,
            "Monitor alert"
        );

        self.bus.publish(
            Envelope::new("monitor_alert", topics::MONITOR, &alert)
                .for_execution(&alert.execution_id, &alert.workflow_id),
        );

        let mut state = self.state.write();
        state.alerts.push_back(alert);
        while state.alerts.len() > self.config.history_limit {
            state.alerts.pop_front();
        }
    }

    fn record_finished(&self, execution: &WorkflowExecution) {
        let summary = ExecutionSummary {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            duration_secs: execution.duration_secs(),
            error: execution.error.clone(),
            completed_at: execution.completed_at,
        };

        {
            let mut state = self.state.write();
            match execution.status {
                ExecutionStatus::Completed => {
                    state.completed += 1;
                    if let Some(duration) = summary.duration_secs {
                        state.completed_duration_secs += duration;
                        state.timed_completions += 1;
                    }
                }
                ExecutionStatus::Failed => state.failed += 1,
                ExecutionStatus::Cancelled => state.cancelled += 1,
                ExecutionStatus::Timeout => state.timed_out += 1,
                _ => {}
            }

            if let Some(error) = &execution.error {
                let group = error_group(error, self.config.error_message_max_len);
                *state.errors.entry(group.clone()).or_insert(0) += 1;
                prune_error_groups(&mut state.errors, &group, self.config.max_error_groups);
            }

            state.history.push_front(summary.clone());
            state.history.truncate(self.config.history_limit);
        }

        info!(
            execution_id = %execution.id,
            status = %execution.status,
            duration_secs = summary.duration_secs.unwrap_or_default(),
            "Execution finished"
        );

        let metrics = self.metrics();
        self.bus.publish(
            Envelope::new(
                "metrics_update",
                topics::MONITOR,
                json!({ "execution": summary, "metrics": metrics }),
            )
            .for_execution(&execution.id, &execution.workflow_id),
        );
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        let state = self.state.read();

        let finished = state.completed + state.failed + state.cancelled + state.timed_out;
        let success_rate = if finished == 0 {
            0.0
        } else {
            state.completed as f64 / finished as f64
        };
        let average_duration_secs = (state.timed_completions > 0)
            .then(|| state.completed_duration_secs / state.timed_completions as f64);

        let mut top_errors: Vec<ErrorCount> = state
            .errors
            .iter()
            .map(|(message, count)| ErrorCount {
                message: message.clone(),
                count: *count,
            })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        top_errors.truncate(self.config.top_errors);

        ExecutionMetrics {
            total_executions: state.total,
            running: state.watching.len(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            timed_out: state.timed_out,
            success_rate,
            average_duration_secs,
            recent: state.history.iter().cloned().collect(),
            top_errors,
        }
    }

    pub fn alerts(&self) -> Vec<MonitorAlert> {
        self.state.read().alerts.iter().cloned().collect()
    }

    pub fn alerts_for(&self, execution_id: &str) -> Vec<MonitorAlert> {
        self.state
            .read()
            .alerts
            .iter()
            .filter(|alert| alert.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn is_watching(&self, execution_id: &str) -> bool {
        self.state.read().watching.contains(execution_id)
    }
}

/// Grouping key for an error message: ids and numbers are replaced so runs
/// failing the same way share one group
fn error_group(message: &str, max_chars: usize) -> String {
    let without_ids = UUID_PATTERN.replace_all(message, "<id>");
    let normalized = NUMBER_PATTERN.replace_all(&without_ids, "<n>");
    truncate(&normalized, max_chars)
}

/// Drop the rarest groups other than `keep` until at most `limit` remain
fn prune_error_groups(errors: &mut HashMap<String, usize>, keep: &str, limit: usize) {
    while errors.len() > limit.max(1) {
        let rarest = errors
            .iter()
            .filter(|(group, _)| group.as_str() != keep)
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(group, _)| group.clone());
        match rarest {
            Some(group) => {
                errors.remove(&group);
            }
            None => break,
        }
    }
}

fn truncate(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        let mut truncated: String = message.chars().take(max_chars).collect();
        truncated.push_str("...");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::NodeExecution;
    use crate::graph::{NodeType, WorkflowDefinition};
    use flowgate_core::Scope;
    use tokio_test::assert_ok;

    /// Executions held in a map and edited by the test
    #[derive(Default)]
    struct FakeSource {
        executions: RwLock<HashMap<String, WorkflowExecution>>,
    }

    impl FakeSource {
        fn insert(&self, execution: WorkflowExecution) {
            self.executions.write().insert(execution.id.clone(), execution);
        }

        fn update(&self, execution_id: &str, f: impl FnOnce(&mut WorkflowExecution)) {
            if let Some(execution) = self.executions.write().get_mut(execution_id) {
                f(execution);
            }
        }
    }

    #[async_trait]
    impl ExecutionSource for FakeSource {
        async fn snapshot(&self, execution_id: &str) -> Option<WorkflowExecution> {
            self.executions.read().get(execution_id).cloned()
        }

        async fn active_executions(&self) -> Vec<WorkflowExecution> {
            self.executions
                .read()
                .values()
                .filter(|e| !e.status.is_terminal())
                .cloned()
                .collect()
        }
    }

    fn running_execution() -> WorkflowExecution {
        let definition = WorkflowDefinition::new("wf-1", "Monitored");
        let mut execution = WorkflowExecution::new(&definition, HashMap::new(), HashMap::new(), None);
        execution.transition(ExecutionStatus::Running);
        execution
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_secs: 0.02,
            stall_threshold_secs: 0.1,
            stall_alert_cooldown_secs: 10.0,
            long_running_threshold_secs: 0.05,
            ..Default::default()
        }
    }

    fn monitor(source: Arc<FakeSource>, config: MonitorConfig) -> (ExecutionMonitor, EventBus) {
        let bus = EventBus::default();
        (ExecutionMonitor::new(source, bus.clone(), config), bus)
    }

    #[tokio::test]
    async fn test_stall_alert_is_rate_limited() {
        let source = Arc::new(FakeSource::default());
        let execution = running_execution();
        let id = execution.id.clone();
        source.insert(execution);

        let (monitor, bus) = monitor(source.clone(), fast_config());
        let mut alerts = bus.subscribe(Scope::Execution(id.clone()));
        let shutdown = CancellationToken::new();
        let handle = monitor.watch(&id, shutdown.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let stalls = monitor
            .alerts_for(&id)
            .into_iter()
            .filter(|a| a.kind == AlertKind::StalledExecution)
            .count();
        assert_eq!(stalls, 1);

        let envelope = alerts.try_recv().unwrap();
        assert_eq!(envelope.event_type, "monitor_alert");
        assert_eq!(envelope.workflow_id.as_deref(), Some("wf-1"));

        shutdown.cancel();
        assert_ok!(handle.await);
        assert!(!monitor.is_watching(&id));
    }

    #[tokio::test]
    async fn test_no_stall_while_waiting_on_operator() {
        let source = Arc::new(FakeSource::default());
        let mut execution = running_execution();
        execution.transition(ExecutionStatus::Paused);
        let id = execution.id.clone();
        source.insert(execution);

        let (monitor, _bus) = monitor(source, fast_config());
        let shutdown = CancellationToken::new();
        monitor.watch(&id, shutdown.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(monitor.alerts_for(&id).is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_node_timeout_alert_once_per_attempt() {
        let source = Arc::new(FakeSource::default());
        let mut execution = running_execution();
        let mut record = NodeExecution::started("scan", NodeType::Task, 1);
        record.timeout_secs = Some(0.05);
        record.started_at = Some(Utc::now() - chrono::Duration::seconds(1));
        execution.node_executions.push(record);
        execution.progress = 10.0;
        let id = execution.id.clone();
        source.insert(execution);

        let config = MonitorConfig {
            stall_threshold_secs: 60.0,
            ..fast_config()
        };
        let (monitor, _bus) = monitor(source, config);
        let shutdown = CancellationToken::new();
        monitor.watch(&id, shutdown.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let alerts = monitor.alerts_for(&id);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::NodeTimeout);
        assert_eq!(alerts[0].node_id.as_deref(), Some("scan"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_terminal_execution_recorded_in_metrics() {
        let source = Arc::new(FakeSource::default());
        let execution = running_execution();
        let id = execution.id.clone();
        source.insert(execution);

        let (monitor, bus) = monitor(source.clone(), fast_config());
        let mut updates = bus.subscribe(Scope::All);
        let handle = monitor.watch(&id, CancellationToken::new()).unwrap();
        assert!(monitor.watch(&id, CancellationToken::new()).is_none());

        source.update(&id, |execution| {
            execution.error = Some("failed nodes [scan]: scan: boom".to_string());
            execution.transition(ExecutionStatus::Failed);
        });
        assert_ok!(handle.await);

        let metrics = monitor.metrics();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.running, 0);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.recent[0].execution_id, id);
        assert_eq!(metrics.top_errors[0].count, 1);

        let events: Vec<_> = updates.drain().into_iter().map(|e| e.event_type).collect();
        assert!(events.contains(&"metrics_update".to_string()));
    }

    #[tokio::test]
    async fn test_watchdog_gives_up_on_missing_execution() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(source, fast_config());

        let handle = monitor.watch("gone", CancellationToken::new()).unwrap();
        assert_ok!(tokio::time::timeout(Duration::from_secs(2), handle).await);
        assert!(!monitor.is_watching("gone"));
    }

    #[tokio::test]
    async fn test_sweep_flags_long_running_once() {
        let source = Arc::new(FakeSource::default());
        let mut execution = running_execution();
        execution.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let id = execution.id.clone();
        source.insert(execution);

        let (monitor, _bus) = monitor(source.clone(), fast_config());
        let first = monitor.sweep().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, AlertKind::LongRunningExecution);
        assert!(monitor.sweep().await.is_empty());

        source.update(&id, |execution| {
            execution.transition(ExecutionStatus::Completed);
        });
        assert!(monitor.sweep().await.is_empty());
    }

    #[test]
    fn test_metrics_aggregation() {
        let source = Arc::new(FakeSource::default());
        let config = MonitorConfig {
            top_errors: 1,
            error_message_max_len: 10,
            ..Default::default()
        };
        let (monitor, _bus) = monitor(source, config);

        for (status, error) in [
            (ExecutionStatus::Completed, None),
            (ExecutionStatus::Completed, None),
            (ExecutionStatus::Failed, Some("agent unreachable: a-1")),
            (ExecutionStatus::Failed, Some("agent unreachable: a-2")),
            (ExecutionStatus::Timeout, Some("timeout")),
        ] {
            let mut execution = running_execution();
            execution.started_at = Some(Utc::now() - chrono::Duration::seconds(2));
            execution.error = error.map(str::to_string);
            execution.transition(status);
            monitor.record_finished(&execution);
        }

        let metrics = monitor.metrics();
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.timed_out, 1);
        assert!((metrics.success_rate - 0.4).abs() < 1e-9);
        assert!(metrics.average_duration_secs.unwrap() >= 2.0);
        assert_eq!(
            metrics.top_errors,
            vec![ErrorCount {
                message: "agent unre...".to_string(),
                count: 2
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_alert_repeats_after_cooldown() {
        let source = Arc::new(FakeSource::default());
        let execution = running_execution();
        let id = execution.id.clone();
        source.insert(execution);

        let config = MonitorConfig {
            stall_alert_cooldown_secs: 0.25,
            ..fast_config()
        };
        let (monitor, _bus) = monitor(source, config);
        let shutdown = CancellationToken::new();
        monitor.watch(&id, shutdown.clone()).unwrap();

        // Stalled from the start: one alert at the threshold, one per cooldown after
        tokio::time::sleep(Duration::from_millis(500)).await;
        let stalls = monitor
            .alerts_for(&id)
            .into_iter()
            .filter(|a| a.kind == AlertKind::StalledExecution)
            .count();
        assert_eq!(stalls, 2);
        shutdown.cancel();
    }

    #[test]
    fn test_errors_grouped_across_runs() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(source, MonitorConfig::default());

        for _ in 0..3 {
            let mut execution = running_execution();
            execution.error = Some(format!(
                "failed nodes [gate]: gate: Approval request {} expired without a decision",
                Uuid::new_v4()
            ));
            execution.transition(ExecutionStatus::Failed);
            monitor.record_finished(&execution);
        }

        let metrics = monitor.metrics();
        assert_eq!(metrics.top_errors.len(), 1);
        assert_eq!(metrics.top_errors[0].count, 3);
        assert_eq!(
            metrics.top_errors[0].message,
            "failed nodes [gate]: gate: Approval request <id> expired without a decision"
        );
    }

    #[test]
    fn test_error_groups_are_bounded() {
        let source = Arc::new(FakeSource::default());
        let config = MonitorConfig {
            max_error_groups: 2,
            ..Default::default()
        };
        let (monitor, _bus) = monitor(source, config);

        for error in ["disk full", "disk full", "quota exceeded", "permission denied"] {
            let mut execution = running_execution();
            execution.error = Some(error.to_string());
            execution.transition(ExecutionStatus::Failed);
            monitor.record_finished(&execution);
        }

        let messages: Vec<_> = monitor
            .metrics()
            .top_errors
            .into_iter()
            .map(|e| (e.message, e.count))
            .collect();
        assert_eq!(
            messages,
            vec![
                ("disk full".to_string(), 2),
                ("permission denied".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_error_group_normalizes_numbers() {
        assert_eq!(
            error_group("no agent after 0.3s for task 17", 100),
            "no agent after <n>s for task <n>"
        );
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }
}

//! Human approval gate for workflow steps
//!
//! The gate scores the risk of an action, applies auto-approval rules and
//! otherwise keeps a pending [`ApprovalRequest`] until a human decides, the
//! request times out or the owning execution goes away. A suspended branch
//! awaits its decision through a one-shot channel.

pub mod learning;
pub mod risk;
pub mod rules;

pub use learning::{DecisionRecord, LevelStats, PatternAnalysis, RuleSuggestion, ThresholdSuggestion};
pub use risk::{RiskAssessment, RiskLevel, RiskScorer};
pub use rules::AutoApprovalRule;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgate_agents::{InterventionHandler, TaskRequest};
use flowgate_core::{topics, ApprovalConfig, ApprovalTimeouts, Envelope, EventBus};
use parking_lot::{Mutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use learning::DecisionHistory;
use rules::RuleSet;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval request not found: {0}")]
    NotFound(String),

    #[error("Approval request {id} already resolved: {status}")]
    AlreadyResolved { id: String, status: ApprovalStatus },

    #[error("Approval request {0} expired before a decision was provided")]
    Expired(String),

    #[error("Approval request {0} was cancelled")]
    Cancelled(String),

    #[error("Invalid auto-approval rule: {0}")]
    InvalidRule(String),

    #[error("Invalid risk threshold: {0}")]
    InvalidThreshold(String),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

/// Status of an approval request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision
    Pending,
    Approved,
    Rejected,
    /// No decision in time; the fallback was applied
    Expired,
    /// Routed to a higher approver pool, still open
    Escalated,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an approval; selects the default timeout
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    SecurityAction,
    DataAccess,
    Deployment,
    ManualIntervention,
    #[default]
    General,
    ServiceDelivery,
    FinancialTransaction,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityAction => "security_action",
            Self::DataAccess => "data_access",
            Self::Deployment => "deployment",
            Self::ManualIntervention => "manual_intervention",
            Self::General => "general",
            Self::ServiceDelivery => "service_delivery",
            Self::FinancialTransaction => "financial_transaction",
        }
    }

    pub fn default_timeout(&self, timeouts: &ApprovalTimeouts) -> Duration {
        let minutes = match self {
            Self::SecurityAction => timeouts.security_action,
            Self::DataAccess => timeouts.data_access,
            Self::Deployment => timeouts.deployment,
            Self::ManualIntervention => timeouts.manual_intervention,
            Self::General => timeouts.general,
            Self::ServiceDelivery => timeouts.service_delivery,
            Self::FinancialTransaction => timeouts.financial_transaction,
        };
        Duration::from_secs(minutes * 60)
    }
}

/// What happens when nobody decides in time
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalFallback {
    Approve,
    #[default]
    Deny,
    Escalate,
}

/// Approval request information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub execution_id: Option<String>,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
    pub approval_type: ApprovalType,
    /// Action being approved
    pub action: String,
    pub description: Option<String>,
    pub requester: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub risk: RiskAssessment,
    pub status: ApprovalStatus,
    pub fallback: ApprovalFallback,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolver: Option<String>,
    pub reason: Option<String>,
    pub escalation_level: u32,
    /// Approver pool the request has been routed to
    pub escalation_target: Option<String>,
    /// Set when the request expired and its fallback decided the outcome
    pub fallback_applied: Option<ApprovalFallback>,
}

/// Decision delivered to the waiting branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub request_id: String,
    pub approved: bool,
    pub status: ApprovalStatus,
    pub resolver: Option<String>,
    pub reason: Option<String>,
}

impl ApprovalOutcome {
    fn from_request(request: &ApprovalRequest, approved: bool) -> Self {
        Self {
            request_id: request.id.clone(),
            approved,
            status: request.status,
            resolver: request.resolver.clone(),
            reason: request.reason.clone(),
        }
    }
}

/// Parameters of a new approval request
#[derive(Debug, Clone)]
pub struct ApprovalSubmission {
    pub approval_type: ApprovalType,
    pub action: String,
    pub description: Option<String>,
    pub requester: String,
    pub context: Map<String, Value>,
    pub timeout: Option<Duration>,
    pub fallback: ApprovalFallback,
    /// Skip risk based and rule based auto-approval
    pub always_require: bool,
    pub execution_id: Option<String>,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
}

impl ApprovalSubmission {
    pub fn new(approval_type: ApprovalType, action: impl Into<String>) -> Self {
        Self {
            approval_type,
            action: action.into(),
            description: None,
            requester: "system".to_string(),
            context: Map::new(),
            timeout: None,
            fallback: ApprovalFallback::default(),
            always_require: false,
            execution_id: None,
            workflow_id: None,
            node_id: None,
        }
    }

    pub fn requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fallback(mut self, fallback: ApprovalFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn always_require(mut self) -> Self {
        self.always_require = true;
        self
    }

    pub fn for_node(
        mut self,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        self.execution_id = Some(execution_id.into());
        self.workflow_id = Some(workflow_id.into());
        self.node_id = Some(node_id.into());
        self
    }
}

/// Answer to `request_approval`
#[derive(Debug)]
pub enum ApprovalTicket {
    AutoApproved {
        reason: String,
        rule_id: Option<String>,
        assessment: RiskAssessment,
    },
    Pending(PendingApproval),
}

/// Handle for a branch waiting on a decision
#[derive(Debug)]
pub struct PendingApproval {
    pub request_id: String,
    pub expires_at: DateTime<Utc>,
    receiver: oneshot::Receiver<ApprovalOutcome>,
}

/// Result of applying the timeout policy to a request
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// Expired with the fallback decision applied
    Resolved(ApprovalOutcome),
    Escalated {
        level: u32,
        expires_at: DateTime<Utc>,
    },
    /// Already decided, cancelled or expired
    NotPending,
}

struct RequestEntry {
    request: ApprovalRequest,
    /// Length of one decision window, reused on escalation
    window: Duration,
    waiter: Option<oneshot::Sender<ApprovalOutcome>>,
}

/// Approval gate manager
#[derive(Clone)]
pub struct ApprovalGate {
    requests: Arc<RwLock<HashMap<String, RequestEntry>>>,
    rules: Arc<SyncRwLock<RuleSet>>,
    scorer: Arc<SyncRwLock<RiskScorer>>,
    history: Arc<Mutex<DecisionHistory>>,
    suggestions: Arc<Mutex<HashMap<String, RuleSuggestion>>>,
    bus: EventBus,
    config: Arc<ApprovalConfig>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig, bus: EventBus) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            rules: Arc::new(SyncRwLock::new(RuleSet::default())),
            scorer: Arc::new(SyncRwLock::new(RiskScorer::new(&config))),
            history: Arc::new(Mutex::new(DecisionHistory::new(config.history_limit))),
            suggestions: Arc::new(Mutex::new(HashMap::new())),
            bus,
            config: Arc::new(config),
        }
    }

    pub fn assess_risk(&self, action: &str, context: &Map<String, Value>) -> RiskAssessment {
        self.scorer.read().assess(action, context)
    }

    pub fn assess_risk_at(
        &self,
        action: &str,
        context: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        self.scorer.read().assess_at(action, context, now)
    }

    pub fn high_risk_threshold(&self) -> f64 {
        self.scorer.read().high_risk_threshold()
    }

    /// Score the action and either auto-approve it or open a pending request.
    pub async fn request_approval(&self, submission: ApprovalSubmission) -> ApprovalTicket {
        let now = Utc::now();
        let (assessment, in_business_hours) = {
            let scorer = self.scorer.read();
            (
                scorer.assess_at(&submission.action, &submission.context, now),
                scorer.in_business_hours(now),
            )
        };

        let may_auto_approve = !submission.always_require
            && submission.approval_type != ApprovalType::ManualIntervention;

        if may_auto_approve {
            let auto = if !assessment.requires_approval {
                Some((
                    format!(
                        "risk score {:.2} below approval threshold",
                        assessment.score
                    ),
                    None,
                ))
            } else {
                self.rules
                    .read()
                    .first_match(
                        &submission.action,
                        &submission.context,
                        &assessment,
                        in_business_hours,
                    )
                    .map(|rule| {
                        (
                            format!("matched auto-approval rule '{}'", rule.name),
                            Some(rule.id.clone()),
                        )
                    })
            };

            if let Some((reason, rule_id)) = auto {
                debug!(
                    action = %submission.action,
                    risk_score = assessment.score,
                    reason = %reason,
                    "Approval auto-approved"
                );
                self.publish(
                    "approval_auto_approved",
                    submission.execution_id.as_deref(),
                    submission.workflow_id.as_deref(),
                    serde_json::json!({
                        "action": submission.action,
                        "node_id": submission.node_id,
                        "reason": reason,
                        "rule_id": rule_id,
                        "risk": assessment,
                    }),
                );
                return ApprovalTicket::AutoApproved {
                    reason,
                    rule_id,
                    assessment,
                };
            }
        }

        let window = submission
            .timeout
            .unwrap_or_else(|| submission.approval_type.default_timeout(&self.config.timeouts));
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            execution_id: submission.execution_id,
            workflow_id: submission.workflow_id,
            node_id: submission.node_id,
            approval_type: submission.approval_type,
            action: submission.action,
            description: submission.description,
            requester: submission.requester,
            context: submission.context,
            risk: assessment,
            status: ApprovalStatus::Pending,
            fallback: submission.fallback,
            created_at: now,
            expires_at: now + chrono_duration(window),
            resolved_at: None,
            resolver: None,
            reason: None,
            escalation_level: 0,
            escalation_target: None,
            fallback_applied: None,
        };

        let (tx, rx) = oneshot::channel();
        let request_id = request.id.clone();
        let expires_at = request.expires_at;

        info!(
            approval_id = %request_id,
            action = %request.action,
            approval_type = request.approval_type.as_str(),
            risk_level = %request.risk.level,
            "Approval request created"
        );
        self.publish_request("approval_requested", &request);

        self.requests.write().await.insert(
            request_id.clone(),
            RequestEntry {
                request,
                window,
                waiter: Some(tx),
            },
        );

        ApprovalTicket::Pending(PendingApproval {
            request_id,
            expires_at,
            receiver: rx,
        })
    }

    /// Suspend until the request is decided. Expiry is raced against the
    /// decision channel; on expiry the request's fallback decides.
    pub async fn wait(&self, pending: PendingApproval) -> Result<ApprovalOutcome> {
        let PendingApproval {
            request_id,
            mut expires_at,
            mut receiver,
        } = pending;

        loop {
            let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                outcome = &mut receiver => {
                    return outcome.map_err(|_| ApprovalError::Cancelled(request_id));
                }
                _ = tokio::time::sleep(remaining) => {}
            }

            // A manual escalation moves the expiry forward
            let current_expiry = {
                let requests = self.requests.read().await;
                requests
                    .get(&request_id)
                    .filter(|entry| entry.request.status.is_open())
                    .map(|entry| entry.request.expires_at)
            };
            if let Some(current) = current_expiry {
                if current > expires_at {
                    expires_at = current;
                    continue;
                }
            }

            match self.handle_timeout(&request_id).await? {
                TimeoutOutcome::Resolved(outcome) => return Ok(outcome),
                TimeoutOutcome::Escalated { expires_at: next, .. } => expires_at = next,
                TimeoutOutcome::NotPending => {
                    // Decided concurrently; the outcome is on the channel
                    return receiver
                        .await
                        .map_err(|_| ApprovalError::Cancelled(request_id));
                }
            }
        }
    }

    /// Wait on a request opened elsewhere, such as a manual intervention
    /// raised by the coordinator. A request decided in the meantime yields
    /// its recorded outcome right away.
    pub async fn wait_for(&self, request_id: &str) -> Result<ApprovalOutcome> {
        let pending = {
            let mut requests = self.requests.write().await;
            let entry = requests
                .get_mut(request_id)
                .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;
            let request = &entry.request;

            match request.status {
                ApprovalStatus::Pending | ApprovalStatus::Escalated => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiter = Some(tx);
                    PendingApproval {
                        request_id: request.id.clone(),
                        expires_at: request.expires_at,
                        receiver: rx,
                    }
                }
                ApprovalStatus::Cancelled => {
                    return Err(ApprovalError::Cancelled(request_id.to_string()))
                }
                ApprovalStatus::Approved => return Ok(ApprovalOutcome::from_request(request, true)),
                ApprovalStatus::Rejected => return Ok(ApprovalOutcome::from_request(request, false)),
                ApprovalStatus::Expired => {
                    let approved = request.fallback_applied == Some(ApprovalFallback::Approve);
                    return Ok(ApprovalOutcome::from_request(request, approved));
                }
            }
        };

        self.wait(pending).await
    }

    /// Record a human decision.
    pub async fn provide_approval(
        &self,
        request_id: &str,
        approved: bool,
        resolver: impl Into<String>,
        reason: Option<String>,
    ) -> Result<ApprovalRequest> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let entry = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        if !entry.request.status.is_open() {
            return Err(ApprovalError::AlreadyResolved {
                id: request_id.to_string(),
                status: entry.request.status,
            });
        }

        if now > entry.request.expires_at {
            self.apply_timeout(entry, now);
            return Err(ApprovalError::Expired(request_id.to_string()));
        }

        let resolver = resolver.into();
        let request = &mut entry.request;
        request.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        request.resolved_at = Some(now);
        request.resolver = Some(resolver.clone());
        request.reason = reason;

        if approved {
            info!(approval_id = %request_id, resolver = %resolver, "Approval granted");
        } else {
            warn!(approval_id = %request_id, resolver = %resolver, "Approval denied");
        }

        self.history.lock().record(DecisionRecord {
            request_id: request.id.clone(),
            action: request.action.clone(),
            approval_type: request.approval_type,
            risk_level: request.risk.level,
            risk_score: request.risk.score,
            approved,
            resolver,
            decided_at: now,
        });

        let outcome = ApprovalOutcome::from_request(request, approved);
        if let Some(waiter) = entry.waiter.take() {
            // The waiting branch may already be gone
            let _ = waiter.send(outcome);
        }

        let resolved = entry.request.clone();
        drop(requests);

        self.publish_request("approval_resolved", &resolved);
        Ok(resolved)
    }

    /// Apply the request's fallback now, whatever its expiry time.
    pub async fn handle_timeout(&self, request_id: &str) -> Result<TimeoutOutcome> {
        let mut requests = self.requests.write().await;
        let entry = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        if !entry.request.status.is_open() {
            return Ok(TimeoutOutcome::NotPending);
        }

        Ok(self.apply_timeout(entry, Utc::now()))
    }

    fn apply_timeout(&self, entry: &mut RequestEntry, now: DateTime<Utc>) -> TimeoutOutcome {
        let request = &mut entry.request;

        if request.fallback == ApprovalFallback::Escalate
            && request.escalation_level < self.config.max_escalation_level
        {
            let reason = "no decision before expiry".to_string();
            self.raise_escalation(request, entry.window, now, reason);
            return TimeoutOutcome::Escalated {
                level: request.escalation_level,
                expires_at: request.expires_at,
            };
        }

        // Escalation exhausted counts as a denial
        let applied = match request.fallback {
            ApprovalFallback::Approve => ApprovalFallback::Approve,
            ApprovalFallback::Deny | ApprovalFallback::Escalate => ApprovalFallback::Deny,
        };
        let approved = applied == ApprovalFallback::Approve;

        request.status = ApprovalStatus::Expired;
        request.resolved_at = Some(now);
        request.fallback_applied = Some(applied);
        request.reason = Some(format!(
            "approval expired without a decision; {} applied",
            if approved { "approve" } else { "deny" }
        ));

        warn!(
            approval_id = %request.id,
            fallback = if approved { "approve" } else { "deny" },
            "Approval request expired"
        );

        let outcome = ApprovalOutcome::from_request(request, approved);
        if let Some(waiter) = entry.waiter.take() {
            let _ = waiter.send(outcome.clone());
        }
        self.publish_request("approval_expired", request);

        TimeoutOutcome::Resolved(outcome)
    }

    fn raise_escalation(
        &self,
        request: &mut ApprovalRequest,
        window: Duration,
        now: DateTime<Utc>,
        reason: String,
    ) {
        request.escalation_level += 1;
        request.status = ApprovalStatus::Escalated;
        request.expires_at = request.expires_at.max(now) + chrono_duration(window);
        request.escalation_target = Some(format!("level-{}", request.escalation_level));

        warn!(
            approval_id = %request.id,
            level = request.escalation_level,
            reason = %reason,
            "Approval request escalated"
        );

        self.publish(
            "approval_escalated",
            request.execution_id.as_deref(),
            request.workflow_id.as_deref(),
            serde_json::json!({
                "request": &*request,
                "reason": reason,
            }),
        );
    }

    /// Route an open request to the next approver pool and extend its window.
    pub async fn escalate(&self, request_id: &str, reason: &str) -> Result<ApprovalRequest> {
        let mut requests = self.requests.write().await;
        let entry = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        if !entry.request.status.is_open() {
            return Err(ApprovalError::AlreadyResolved {
                id: request_id.to_string(),
                status: entry.request.status,
            });
        }

        let window = entry.window;
        self.raise_escalation(&mut entry.request, window, Utc::now(), reason.to_string());
        Ok(entry.request.clone())
    }

    /// Apply the timeout policy to every open request past its expiry.
    /// Returns the ids that were touched.
    pub async fn expire_overdue(&self) -> Vec<String> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let mut touched = Vec::new();

        for (id, entry) in requests.iter_mut() {
            if entry.request.status.is_open() && entry.request.expires_at <= now {
                self.apply_timeout(entry, now);
                touched.push(id.clone());
            }
        }

        if !touched.is_empty() {
            debug!(count = touched.len(), "Overdue approval requests processed");
        }
        touched
    }

    /// Cancel every open request of an execution; their waiters see
    /// [`ApprovalError::Cancelled`].
    pub async fn cancel_for_execution(&self, execution_id: &str) -> Vec<String> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let mut cancelled = Vec::new();

        for entry in requests.values_mut() {
            let request = &mut entry.request;
            if request.execution_id.as_deref() != Some(execution_id) || !request.status.is_open() {
                continue;
            }

            request.status = ApprovalStatus::Cancelled;
            request.resolved_at = Some(now);
            entry.waiter = None;
            cancelled.push(request.id.clone());

            info!(approval_id = %request.id, execution_id = %execution_id, "Approval request cancelled");
            self.publish_request("approval_cancelled", request);
        }

        cancelled
    }

    pub async fn get_request(&self, request_id: &str) -> Option<ApprovalRequest> {
        let requests = self.requests.read().await;
        requests.get(request_id).map(|entry| entry.request.clone())
    }

    /// Open requests, oldest first
    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        let requests = self.requests.read().await;
        let mut pending: Vec<_> = requests
            .values()
            .filter(|entry| entry.request.status.is_open())
            .map(|entry| entry.request.clone())
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }

    pub async fn list_for_execution(&self, execution_id: &str) -> Vec<ApprovalRequest> {
        let requests = self.requests.read().await;
        let mut matching: Vec<_> = requests
            .values()
            .filter(|entry| entry.request.execution_id.as_deref() == Some(execution_id))
            .map(|entry| entry.request.clone())
            .collect();
        matching.sort_by_key(|request| request.created_at);
        matching
    }

    /// Drop resolved requests older than `max_age`. Returns how many were removed.
    pub async fn cleanup_old_requests(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono_duration(max_age);
        let mut requests = self.requests.write().await;
        let before = requests.len();

        requests.retain(|_, entry| {
            entry.request.status.is_open()
                || entry.request.resolved_at.map_or(false, |t| t > cutoff)
        });

        before - requests.len()
    }

    pub fn add_rule(&self, rule: AutoApprovalRule) -> Result<()> {
        info!(rule_id = %rule.id, name = %rule.name, "Auto-approval rule added");
        self.rules.write().add(rule)
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.write().remove(rule_id)
    }

    pub fn rules(&self) -> Vec<AutoApprovalRule> {
        self.rules.read().list()
    }

    pub fn analyze_approval_patterns(&self) -> PatternAnalysis {
        self.history.lock().analyze()
    }

    /// Propose rules from history. Proposals are kept until accepted.
    pub fn suggest_auto_approval_rules(&self) -> Vec<RuleSuggestion> {
        let suggestions = self
            .history
            .lock()
            .suggest_rules(self.config.learning_min_samples);

        let mut stored = self.suggestions.lock();
        stored.clear();
        for suggestion in &suggestions {
            stored.insert(suggestion.id.clone(), suggestion.clone());
        }
        suggestions
    }

    pub fn suggest_threshold_update(&self) -> Option<ThresholdSuggestion> {
        let (current, ceiling) = {
            let scorer = self.scorer.read();
            (scorer.high_risk_threshold(), scorer.critical_risk_threshold())
        };
        self.history
            .lock()
            .suggest_threshold(current, ceiling, self.config.learning_min_samples)
    }

    /// Operator confirmation of a learned rule
    pub fn accept_rule_suggestion(&self, suggestion_id: &str) -> Result<AutoApprovalRule> {
        let suggestion = self
            .suggestions
            .lock()
            .remove(suggestion_id)
            .ok_or_else(|| ApprovalError::NotFound(suggestion_id.to_string()))?;

        self.add_rule(suggestion.rule.clone())?;
        Ok(suggestion.rule)
    }

    /// Operator confirmation of a threshold proposal
    pub fn apply_threshold_suggestion(&self, suggestion: &ThresholdSuggestion) -> Result<()> {
        let mut scorer = self.scorer.write();
        let critical = scorer.critical_risk_threshold();

        if !(0.0..=critical).contains(&suggestion.suggested) {
            return Err(ApprovalError::InvalidThreshold(format!(
                "{} must be within [0, {}]",
                suggestion.suggested, critical
            )));
        }

        info!(
            from = scorer.high_risk_threshold(),
            to = suggestion.suggested,
            "High risk threshold updated"
        );
        scorer.set_high_risk_threshold(suggestion.suggested);
        Ok(())
    }

    /// Periodically expire overdue requests until cancelled.
    pub fn start_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let gate = self.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        gate.expire_overdue().await;
                    }
                }
            }
            debug!("Approval sweeper stopped");
        })
    }

    fn publish_request(&self, event_type: &str, request: &ApprovalRequest) {
        self.publish(
            event_type,
            request.execution_id.as_deref(),
            request.workflow_id.as_deref(),
            request,
        );
    }

    fn publish<T: Serialize>(
        &self,
        event_type: &str,
        execution_id: Option<&str>,
        workflow_id: Option<&str>,
        payload: T,
    ) {
        let mut envelope = Envelope::new(event_type, topics::APPROVAL, payload);
        envelope.execution_id = execution_id.map(str::to_string);
        envelope.workflow_id = workflow_id.map(str::to_string);
        self.bus.publish(envelope);
    }
}

#[async_trait]
impl InterventionHandler for ApprovalGate {
    async fn request_intervention(&self, task: &TaskRequest, reason: &str) -> Option<String> {
        let mut submission = ApprovalSubmission::new(ApprovalType::ManualIntervention, &task.action)
            .requester("coordinator")
            .description(reason)
            .with_context("task_id", Value::String(task.id.clone()))
            .with_context("parameters", task.parameters.clone());
        submission.execution_id = task.execution_id.clone();
        submission.workflow_id = task.workflow_id.clone();
        submission.node_id = task.node_id.clone();

        match self.request_approval(submission).await {
            ApprovalTicket::Pending(pending) => Some(pending.request_id),
            ApprovalTicket::AutoApproved { .. } => None,
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

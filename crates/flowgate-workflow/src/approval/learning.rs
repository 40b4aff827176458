//! Learning from human approval decisions.
//!
//! Every human decision is kept in a bounded history. The history is grouped
//! by risk level to propose auto-approval rules and threshold changes. Nothing
//! here changes the gate's behavior; proposals are applied only through the
//! gate's explicit accept/apply operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

use super::risk::RiskLevel;
use super::rules::AutoApprovalRule;
use super::ApprovalType;

const RULE_APPROVAL_RATE: f64 = 0.9;
const RAISE_THRESHOLD_RATE: f64 = 0.8;
const LOWER_THRESHOLD_RATE: f64 = 0.5;
const THRESHOLD_STEP: f64 = 0.05;
/// The high-risk threshold is never lowered into the LOW band
const THRESHOLD_FLOOR: f64 = 0.4;

/// One human decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub request_id: String,
    pub action: String,
    pub approval_type: ApprovalType,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub approved: bool,
    pub resolver: String,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: RiskLevel,
    pub total: usize,
    pub approved: usize,
    pub approval_rate: f64,
}

/// Output of `analyze_approval_patterns`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub total_decisions: usize,
    pub overall_approval_rate: f64,
    /// Only levels with at least one decision, LOW first
    pub by_level: Vec<LevelStats>,
}

impl PatternAnalysis {
    pub fn level(&self, level: RiskLevel) -> Option<&LevelStats> {
        self.by_level.iter().find(|stats| stats.level == level)
    }
}

/// A learned rule waiting for operator confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSuggestion {
    pub id: String,
    pub risk_level: RiskLevel,
    pub sample_size: usize,
    pub approval_rate: f64,
    pub confidence: f64,
    pub rule: AutoApprovalRule,
}

/// A proposed change of the high-risk threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSuggestion {
    pub current: f64,
    pub suggested: f64,
    pub reason: String,
}

pub(crate) struct DecisionHistory {
    records: VecDeque<DecisionRecord>,
    limit: usize,
}

impl DecisionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit,
        }
    }

    pub fn record(&mut self, record: DecisionRecord) {
        self.records.push_back(record);
        while self.records.len() > self.limit {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn analyze(&self) -> PatternAnalysis {
        let total_decisions = self.records.len();
        let approved_total = self.records.iter().filter(|r| r.approved).count();

        let by_level = RiskLevel::all()
            .into_iter()
            .filter_map(|level| {
                let (total, approved) = self
                    .records
                    .iter()
                    .filter(|r| r.risk_level == level)
                    .fold((0, 0), |(total, approved), r| {
                        (total + 1, approved + usize::from(r.approved))
                    });
                (total > 0).then(|| LevelStats {
                    level,
                    total,
                    approved,
                    approval_rate: ratio(approved, total),
                })
            })
            .collect();

        PatternAnalysis {
            total_decisions,
            overall_approval_rate: ratio(approved_total, total_decisions),
            by_level,
        }
    }

    /// One rule per level with enough samples and an approval rate above
    /// 90%. The rule covers the approved actions seen at that level up to the
    /// highest score observed there.
    pub fn suggest_rules(&self, min_samples: usize) -> Vec<RuleSuggestion> {
        let analysis = self.analyze();

        analysis
            .by_level
            .iter()
            .filter(|stats| stats.total >= min_samples && stats.approval_rate > RULE_APPROVAL_RATE)
            .map(|stats| {
                let at_level = || self.records.iter().filter(move |r| r.risk_level == stats.level);

                let max_score = at_level().map(|r| r.risk_score).fold(0.0, f64::max);
                let actions: BTreeSet<&str> = at_level()
                    .filter(|r| r.approved)
                    .map(|r| r.action.as_str())
                    .collect();
                let pattern = format!(
                    "^({})$",
                    actions
                        .iter()
                        .map(|action| regex::escape(action))
                        .collect::<Vec<_>>()
                        .join("|")
                );

                let rule = AutoApprovalRule::new(
                    format!("learned {} risk approvals", stats.level),
                    max_score,
                )
                .with_pattern(pattern)
                .with_confidence(stats.approval_rate);

                RuleSuggestion {
                    id: Uuid::new_v4().to_string(),
                    risk_level: stats.level,
                    sample_size: stats.total,
                    approval_rate: stats.approval_rate,
                    confidence: stats.approval_rate,
                    rule,
                }
            })
            .collect()
    }

    /// Raise the threshold when HIGH risk requests are nearly always approved,
    /// lower it when MEDIUM risk requests are mostly rejected.
    pub fn suggest_threshold(
        &self,
        current: f64,
        ceiling: f64,
        min_samples: usize,
    ) -> Option<ThresholdSuggestion> {
        let analysis = self.analyze();

        if let Some(high) = analysis
            .level(RiskLevel::High)
            .filter(|stats| stats.total >= min_samples)
        {
            if high.approval_rate > RAISE_THRESHOLD_RATE {
                let suggested = round2((current + THRESHOLD_STEP).min(ceiling));
                if suggested > current {
                    return Some(ThresholdSuggestion {
                        current,
                        suggested,
                        reason: format!(
                            "HIGH risk requests approved {:.0}% of the time over {} decisions",
                            high.approval_rate * 100.0,
                            high.total
                        ),
                    });
                }
            }
        }

        if let Some(medium) = analysis
            .level(RiskLevel::Medium)
            .filter(|stats| stats.total >= min_samples)
        {
            if medium.approval_rate < LOWER_THRESHOLD_RATE {
                let suggested = round2((current - THRESHOLD_STEP).max(THRESHOLD_FLOOR));
                if suggested < current {
                    return Some(ThresholdSuggestion {
                        current,
                        suggested,
                        reason: format!(
                            "MEDIUM risk requests approved only {:.0}% of the time over {} decisions",
                            medium.approval_rate * 100.0,
                            medium.total
                        ),
                    });
                }
            }
        }

        None
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &str, level: RiskLevel, score: f64, approved: bool) -> DecisionRecord {
        DecisionRecord {
            request_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            approval_type: ApprovalType::General,
            risk_level: level,
            risk_score: score,
            approved,
            resolver: "ops".to_string(),
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = DecisionHistory::new(3);
        for _ in 0..5 {
            history.record(record("a", RiskLevel::Low, 0.1, true));
        }
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_analysis_by_level() {
        let mut history = DecisionHistory::new(100);
        history.record(record("a", RiskLevel::High, 0.7, true));
        history.record(record("b", RiskLevel::High, 0.7, false));
        history.record(record("c", RiskLevel::Critical, 0.9, true));

        let analysis = history.analyze();
        assert_eq!(analysis.total_decisions, 3);
        assert!((analysis.overall_approval_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(analysis.by_level.len(), 2);
        assert_eq!(analysis.level(RiskLevel::High).unwrap().approval_rate, 0.5);
        assert!(analysis.level(RiskLevel::Low).is_none());
    }

    #[test]
    fn test_rule_suggestion_needs_samples_and_rate() {
        let mut history = DecisionHistory::new(100);
        for _ in 0..4 {
            history.record(record("restart_web", RiskLevel::Critical, 0.85, true));
        }
        assert!(history.suggest_rules(5).is_empty());

        history.record(record("restart_db", RiskLevel::Critical, 0.9, true));
        let suggestions = history.suggest_rules(5);
        assert_eq!(suggestions.len(), 1);

        let suggestion = &suggestions[0];
        assert_eq!(suggestion.risk_level, RiskLevel::Critical);
        assert_eq!(suggestion.confidence, 1.0);
        assert_eq!(suggestion.rule.max_risk_score, 0.9);
        assert_eq!(suggestion.rule.action_patterns, vec!["^(restart_db|restart_web)$"]);

        // One rejection out of six drops the rate to 83%
        history.record(record("restart_db", RiskLevel::Critical, 0.9, false));
        assert!(history.suggest_rules(5).is_empty());
    }

    #[test]
    fn test_threshold_suggestions() {
        let mut history = DecisionHistory::new(100);
        for _ in 0..5 {
            history.record(record("x", RiskLevel::High, 0.7, true));
        }
        let raise = history.suggest_threshold(0.8, 0.9, 5).unwrap();
        assert_eq!(raise.suggested, 0.85);

        // Already at the ceiling
        assert!(history.suggest_threshold(0.9, 0.9, 5).is_none());

        let mut history = DecisionHistory::new(100);
        for i in 0..6 {
            history.record(record("y", RiskLevel::Medium, 0.4, i == 0));
        }
        let lower = history.suggest_threshold(0.8, 0.9, 5).unwrap();
        assert_eq!(lower.suggested, 0.75);
        assert!(lower.reason.contains("MEDIUM"));
    }
}

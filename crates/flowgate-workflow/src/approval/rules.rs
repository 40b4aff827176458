//! Auto-approval rules.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::risk::RiskAssessment;
use super::ApprovalError;

/// Approves a request without a human when every constraint holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoApprovalRule {
    pub id: String,
    pub name: String,
    /// Highest risk score the rule may approve
    pub max_risk_score: f64,
    /// Case insensitive regexes; the action must match one of them. Empty
    /// means any action.
    #[serde(default)]
    pub action_patterns: Vec<String>,
    /// Context keys that must equal the given values
    #[serde(default)]
    pub context_constraints: Map<String, Value>,
    #[serde(default)]
    pub business_hours_only: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 1.0 for operator rules, the observed approval rate for learned ones
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn default_confidence() -> f64 {
    1.0
}

impl AutoApprovalRule {
    pub fn new(name: impl Into<String>, max_risk_score: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            max_risk_score,
            action_patterns: Vec::new(),
            context_constraints: Map::new(),
            business_hours_only: false,
            enabled: true,
            confidence: 1.0,
            created_at: Utc::now(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.action_patterns.push(pattern.into());
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_constraints.insert(key.into(), value);
        self
    }

    pub fn business_hours_only(mut self) -> Self {
        self.business_hours_only = true;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

struct CompiledRule {
    rule: AutoApprovalRule,
    patterns: Vec<Regex>,
}

impl CompiledRule {
    fn compile(rule: AutoApprovalRule) -> Result<Self, ApprovalError> {
        if !(0.0..=1.0).contains(&rule.max_risk_score) {
            return Err(ApprovalError::InvalidRule(format!(
                "rule {} has max_risk_score {} outside [0, 1]",
                rule.name, rule.max_risk_score
            )));
        }

        let patterns = rule
            .action_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        ApprovalError::InvalidRule(format!(
                            "rule {} has invalid pattern '{}': {}",
                            rule.name, pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rule, patterns })
    }

    fn matches(
        &self,
        action: &str,
        context: &Map<String, Value>,
        assessment: &RiskAssessment,
        in_business_hours: bool,
    ) -> bool {
        if !self.rule.enabled || assessment.score > self.rule.max_risk_score {
            return false;
        }
        if self.rule.business_hours_only && !in_business_hours {
            return false;
        }
        if !self.patterns.is_empty() && !self.patterns.iter().any(|re| re.is_match(action)) {
            return false;
        }
        self.rule
            .context_constraints
            .iter()
            .all(|(key, expected)| context.get(key) == Some(expected))
    }
}

/// Ordered rule list; the first matching rule wins.
#[derive(Default)]
pub(crate) struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Add a rule, replacing one with the same id in place
    pub fn add(&mut self, rule: AutoApprovalRule) -> Result<(), ApprovalError> {
        let compiled = CompiledRule::compile(rule)?;
        match self.rules.iter_mut().find(|r| r.rule.id == compiled.rule.id) {
            Some(existing) => *existing = compiled,
            None => self.rules.push(compiled),
        }
        Ok(())
    }

    pub fn remove(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.rule.id != rule_id);
        self.rules.len() != before
    }

    pub fn first_match(
        &self,
        action: &str,
        context: &Map<String, Value>,
        assessment: &RiskAssessment,
        in_business_hours: bool,
    ) -> Option<&AutoApprovalRule> {
        self.rules
            .iter()
            .find(|r| r.matches(action, context, assessment, in_business_hours))
            .map(|r| &r.rule)
    }

    pub fn list(&self) -> Vec<AutoApprovalRule> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::risk::RiskLevel;
    use serde_json::json;

    fn assessment(score: f64) -> RiskAssessment {
        RiskAssessment {
            score,
            level: RiskLevel::from_score(score),
            factors: Vec::new(),
            requires_approval: true,
            requires_escalation: false,
        }
    }

    #[test]
    fn test_rule_matching() {
        let mut rules = RuleSet::default();
        rules
            .add(
                AutoApprovalRule::new("staging deploys", 0.85)
                    .with_pattern("^deploy_")
                    .with_constraint("environment", json!("staging")),
            )
            .unwrap();

        let staging = json!({ "environment": "staging" }).as_object().cloned().unwrap();
        let production = json!({ "environment": "production" }).as_object().cloned().unwrap();

        assert!(rules
            .first_match("DEPLOY_web", &staging, &assessment(0.8), false)
            .is_some());
        assert!(rules
            .first_match("deploy_web", &production, &assessment(0.8), false)
            .is_none());
        assert!(rules
            .first_match("rollback_web", &staging, &assessment(0.8), false)
            .is_none());
        assert!(rules
            .first_match("deploy_web", &staging, &assessment(0.9), false)
            .is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let mut rules = RuleSet::default();
        let first = AutoApprovalRule::new("first", 1.0);
        let first_id = first.id.clone();
        rules.add(first).unwrap();
        rules.add(AutoApprovalRule::new("second", 1.0)).unwrap();

        let matched = rules
            .first_match("anything", &Map::new(), &assessment(0.5), false)
            .unwrap();
        assert_eq!(matched.id, first_id);

        assert!(rules.remove(&first_id));
        assert!(!rules.remove(&first_id));
        assert_eq!(rules.list().len(), 1);
    }

    #[test]
    fn test_business_hours_and_disabled() {
        let mut rules = RuleSet::default();
        rules
            .add(AutoApprovalRule::new("office", 1.0).business_hours_only())
            .unwrap();
        rules.add(AutoApprovalRule::new("off", 1.0).disabled()).unwrap();

        let empty = Map::new();
        assert!(rules.first_match("x", &empty, &assessment(0.9), false).is_none());
        assert_eq!(
            rules.first_match("x", &empty, &assessment(0.9), true).unwrap().name,
            "office"
        );
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let mut rules = RuleSet::default();

        let bad_pattern = AutoApprovalRule::new("bad", 0.5).with_pattern("(unclosed");
        assert!(matches!(rules.add(bad_pattern), Err(ApprovalError::InvalidRule(_))));

        let bad_score = AutoApprovalRule::new("bad", 1.5);
        assert!(matches!(rules.add(bad_score), Err(ApprovalError::InvalidRule(_))));

        assert!(rules.list().is_empty());
    }
}

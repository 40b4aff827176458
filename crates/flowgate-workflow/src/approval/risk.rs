//! Risk scoring for actions that may need a human decision.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use flowgate_core::ApprovalConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

const HIGH_RISK_KEYWORDS: &[&str] = &[
    "delete",
    "drop",
    "destroy",
    "isolate",
    "shutdown",
    "terminate",
    "wipe",
    "purge",
    "revoke",
    "disable",
    "production",
    "transfer",
    "payment",
];

const MEDIUM_RISK_KEYWORDS: &[&str] = &[
    "modify",
    "update",
    "restart",
    "deploy",
    "grant",
    "access",
    "change",
    "config",
    "scale",
    "migrate",
    "quarantine",
];

const HIGH_KEYWORD_WEIGHT: f64 = 0.7;
const MEDIUM_KEYWORD_WEIGHT: f64 = 0.4;
const AFFECTED_SYSTEMS_WEIGHT: f64 = 0.2;
const AFFECTED_SYSTEMS_LIMIT: usize = 5;
const BUSINESS_HOURS_WEIGHT: f64 = 0.1;
const CRITICAL_SYSTEM_WEIGHT: f64 = 0.3;
const FINANCIAL_IMPACT_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn all() -> [RiskLevel; 4] {
        [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ]
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of scoring one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Score in `[0, 1]`
    pub score: f64,
    pub level: RiskLevel,
    /// Human readable contributions to the score
    pub factors: Vec<String>,
    pub requires_approval: bool,
    pub requires_escalation: bool,
}

/// Keyword and context based risk scorer.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    high_risk_threshold: f64,
    critical_risk_threshold: f64,
    financial_impact_threshold: f64,
    business_hours_start: u32,
    business_hours_end: u32,
}

impl RiskScorer {
    pub fn new(config: &ApprovalConfig) -> Self {
        Self {
            high_risk_threshold: config.high_risk_threshold,
            critical_risk_threshold: config.critical_risk_threshold,
            financial_impact_threshold: config.financial_impact_threshold,
            business_hours_start: config.business_hours_start,
            business_hours_end: config.business_hours_end,
        }
    }

    pub fn high_risk_threshold(&self) -> f64 {
        self.high_risk_threshold
    }

    pub fn critical_risk_threshold(&self) -> f64 {
        self.critical_risk_threshold
    }

    pub(crate) fn set_high_risk_threshold(&mut self, threshold: f64) {
        self.high_risk_threshold = threshold;
    }

    /// Monday to Friday within the configured UTC hour window
    pub fn in_business_hours(&self, now: DateTime<Utc>) -> bool {
        let weekday = now.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return false;
        }
        (self.business_hours_start..self.business_hours_end).contains(&now.hour())
    }

    pub fn assess(&self, action: &str, context: &Map<String, Value>) -> RiskAssessment {
        self.assess_at(action, context, Utc::now())
    }

    pub fn assess_at(
        &self,
        action: &str,
        context: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let mut score = 0.0;
        let mut factors = Vec::new();
        let action_lower = action.to_lowercase();

        if let Some(keyword) = HIGH_RISK_KEYWORDS
            .iter()
            .find(|keyword| action_lower.contains(*keyword))
        {
            score += HIGH_KEYWORD_WEIGHT;
            factors.push(format!("high-risk action keyword '{}'", keyword));
        } else if let Some(keyword) = MEDIUM_RISK_KEYWORDS
            .iter()
            .find(|keyword| action_lower.contains(*keyword))
        {
            score += MEDIUM_KEYWORD_WEIGHT;
            factors.push(format!("medium-risk action keyword '{}'", keyword));
        }

        let affected = affected_systems(context);
        if affected > AFFECTED_SYSTEMS_LIMIT {
            score += AFFECTED_SYSTEMS_WEIGHT;
            factors.push(format!("{} affected systems", affected));
        }

        if self.in_business_hours(now) {
            score += BUSINESS_HOURS_WEIGHT;
            factors.push("during business hours".to_string());
        }

        if context_value(context, "critical_system", "criticalSystem")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            score += CRITICAL_SYSTEM_WEIGHT;
            factors.push("critical system".to_string());
        }

        if let Some(impact) =
            context_value(context, "financial_impact", "financialImpact").and_then(Value::as_f64)
        {
            if impact > self.financial_impact_threshold {
                score += FINANCIAL_IMPACT_WEIGHT;
                factors.push(format!("financial impact {:.2}", impact));
            }
        }

        let score = round4(score.clamp(0.0, 1.0));

        RiskAssessment {
            score,
            level: RiskLevel::from_score(score),
            factors,
            requires_approval: score >= self.high_risk_threshold,
            requires_escalation: score >= self.critical_risk_threshold,
        }
    }
}

fn context_value<'a>(context: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    context.get(snake).or_else(|| context.get(camel))
}

/// Affected systems given either as a list or as a count
fn affected_systems(context: &Map<String, Value>) -> usize {
    match context_value(context, "affected_systems", "affectedSystems") {
        Some(Value::Array(items)) => items.len(),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        _ => 0,
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn scorer() -> RiskScorer {
        RiskScorer::new(&ApprovalConfig::default())
    }

    fn context(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    // Saturday, outside business hours
    fn weekend() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
    }

    // Wednesday 10:00 UTC
    fn weekday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_critical_isolation() {
        let assessment = scorer().assess_at(
            "isolate_production_server",
            &context(json!({
                "affectedSystems": ["a", "b", "c", "d", "e", "f"],
                "criticalSystem": true,
            })),
            weekend(),
        );

        assert_eq!(assessment.score, 1.0);
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert!(assessment.requires_approval);
        assert!(assessment.requires_escalation);
        assert_eq!(assessment.factors.len(), 3);
    }

    #[test]
    fn test_levels() {
        let scorer = scorer();
        let empty = Map::new();

        let low = scorer.assess_at("read_report", &empty, weekend());
        assert_eq!(low.score, 0.0);
        assert_eq!(low.level, RiskLevel::Low);
        assert!(!low.requires_approval);

        let medium = scorer.assess_at("restart_service", &empty, weekend());
        assert_eq!(medium.score, 0.4);
        assert_eq!(medium.level, RiskLevel::Medium);

        let high = scorer.assess_at("delete_cache", &empty, weekend());
        assert_eq!(high.score, 0.7);
        assert_eq!(high.level, RiskLevel::High);
        assert!(!high.requires_approval);

        let daytime = scorer.assess_at("delete_cache", &empty, weekday_morning());
        assert_eq!(daytime.score, 0.8);
        assert_eq!(daytime.level, RiskLevel::Critical);
        assert!(daytime.requires_approval);
        assert!(!daytime.requires_escalation);
    }

    #[test]
    fn test_context_factors() {
        let scorer = scorer();

        let assessment = scorer.assess_at(
            "update_invoice",
            &context(json!({ "financial_impact": 25000.0, "affected_systems": 8 })),
            weekend(),
        );
        assert_eq!(assessment.score, 0.8);
        assert!(assessment.factors.iter().any(|f| f.starts_with("financial impact")));
        assert!(assessment.factors.iter().any(|f| f == "8 affected systems"));

        let below = scorer.assess_at(
            "update_invoice",
            &context(json!({ "financialImpact": 500.0, "affectedSystems": 5 })),
            weekend(),
        );
        assert_eq!(below.score, 0.4);
    }

    #[test]
    fn test_business_hours_window() {
        let scorer = scorer();

        assert!(scorer.in_business_hours(weekday_morning()));
        assert!(!scorer.in_business_hours(weekend()));
        assert!(!scorer.in_business_hours(Utc.with_ymd_and_hms(2024, 6, 5, 17, 0, 0).unwrap()));
        assert!(scorer.in_business_hours(Utc.with_ymd_and_hms(2024, 6, 5, 9, 0, 0).unwrap()));
    }

    #[test]
    fn test_level_serialization() {
        assert_eq!(serde_json::to_value(RiskLevel::Critical).unwrap(), "CRITICAL");
        assert!(RiskLevel::Low < RiskLevel::High);
    }
}

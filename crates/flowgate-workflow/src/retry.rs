use flowgate_agents::CoordinationError;
use flowgate_core::EngineConfig;
use rand::Rng;
use std::time::Duration;

use crate::graph::TaskConfig;

/// Retry schedule of one task node
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Policy configured on a task node, engine defaults filling the gaps
    pub fn for_task(task: &TaskConfig, engine: &EngineConfig) -> Self {
        let initial = task
            .retry_delay_secs
            .unwrap_or(engine.default_retry_delay_secs)
            .max(0.0);

        Self::new(task.retry_count).with_backoff(
            Duration::from_secs_f64(initial),
            Duration::from_secs_f64((initial * 32.0).max(initial)),
        )
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt follows after `retries_done` retries
    pub fn should_retry(&self, retries_done: u32, error: &CoordinationError) -> bool {
        retries_done < self.max_retries && is_retryable(error)
    }

    /// Delay before retry number `attempt` (0 based)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_backoff = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let backoff = base_backoff.min(self.max_backoff.as_millis() as f64);

        let backoff = if self.jitter {
            let mut rng = rand::thread_rng();
            let jitter_factor = rng.gen_range(0.5..1.5);
            backoff * jitter_factor
        } else {
            backoff
        };

        Duration::from_millis(backoff as u64)
    }
}

/// Step failures and timeouts are retried; placement failures are final
fn is_retryable(error: &CoordinationError) -> bool {
    match error {
        CoordinationError::StepFailed { .. } => true,
        CoordinationError::Timeout { .. } => true,
        CoordinationError::NoCapableAgent { .. } => false,
        CoordinationError::NoAlternateAgent { .. } => false,
        CoordinationError::AgentNotFound(_) => false,
        CoordinationError::InvalidAgent(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_failed() -> CoordinationError {
        CoordinationError::StepFailed {
            agent_id: "a".to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(10))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_backoff(0).as_millis(), 100);
        assert_eq!(policy.calculate_backoff(1).as_millis(), 200);
        assert_eq!(policy.calculate_backoff(2).as_millis(), 400);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(300))
            .with_jitter(false);

        assert_eq!(policy.calculate_backoff(5).as_millis(), 300);
    }

    #[test]
    fn test_jitter_range() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(1000), Duration::from_secs(10));

        for _ in 0..20 {
            let backoff = policy.calculate_backoff(0).as_millis();
            assert!((500..1500).contains(&backoff));
        }
    }

    #[test]
    fn test_retry_decision() {
        let policy = RetryPolicy::new(2);

        assert!(policy.should_retry(0, &step_failed()));
        assert!(policy.should_retry(1, &step_failed()));
        assert!(!policy.should_retry(2, &step_failed()));
        assert!(!policy.should_retry(
            0,
            &CoordinationError::NoCapableAgent {
                capability: "x".to_string(),
                waited_secs: 1.0,
                intervention: None,
            }
        ));
    }

    #[test]
    fn test_for_task_uses_defaults() {
        let task: TaskConfig = serde_json::from_value(serde_json::json!({
            "action": "scan",
            "retryCount": 3,
        }))
        .unwrap();
        let policy = RetryPolicy::for_task(&task, &EngineConfig::default());

        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));

        let task: TaskConfig = serde_json::from_value(serde_json::json!({
            "action": "scan",
            "retry_delay_secs": 0.5,
        }))
        .unwrap();
        let policy = RetryPolicy::for_task(&task, &EngineConfig::default());
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
    }
}

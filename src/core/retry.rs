//! Per-agent retry with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{AgentError, ConfigError};

/// How often and how patiently a failed agent is re-run.
///
/// Only [`AgentError::Failed`] is retried; timeouts, cancellation and panics
/// end the invocation immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after every retry
    pub backoff_factor: f64,

    /// Substrings of error messages worth retrying; empty retries every failure
    pub retryable: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            retryable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Default backoff with the given number of retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Only retry errors whose message contains `pattern`
    pub fn retry_on(mut self, pattern: impl Into<String>) -> Self {
        self.retryable.push(pattern.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "backoff_factor must be a finite number >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRetry(format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Whether another attempt should follow `retries_done` retries failing with `error`
    pub fn should_retry(&self, retries_done: u32, error: &AgentError) -> bool {
        if retries_done >= self.max_retries {
            return false;
        }
        match error {
            AgentError::Failed(message) => {
                self.retryable.is_empty() || self.retryable.iter().any(|p| message.contains(p.as_str()))
            }
            _ => false,
        }
    }

    /// Delay before retry number `retry` (1-indexed)
    pub fn delay(&self, retry: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = Duration::from_millis(self.initial_delay_ms).as_secs_f64() * self.backoff_factor.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(max))
            .unwrap_or(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(60), Duration::from_millis(350));
    }

    #[test]
    fn test_only_failures_are_retried() {
        let policy = RetryPolicy::new(2);
        assert!(policy.should_retry(0, &AgentError::msg("flaky")));
        assert!(policy.should_retry(1, &AgentError::msg("flaky")));
        assert!(!policy.should_retry(2, &AgentError::msg("flaky")));
        assert!(!policy.should_retry(0, &AgentError::Cancelled));
        assert!(!policy.should_retry(0, &AgentError::TimedOut { elapsed_ms: 5 }));
        assert!(!policy.should_retry(0, &AgentError::Panicked("boom".to_string())));
    }

    #[test]
    fn test_retryable_patterns_filter_messages() {
        let policy = RetryPolicy::new(3).retry_on("rate limited").retry_on("503");
        assert!(policy.should_retry(0, &AgentError::msg("provider: rate limited")));
        assert!(policy.should_retry(0, &AgentError::msg("HTTP 503")));
        assert!(!policy.should_retry(0, &AgentError::msg("invalid prompt")));
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(1).with_backoff_factor(0.5).validate().is_err());
        assert!(RetryPolicy::new(1).with_backoff_factor(f64::NAN).validate().is_err());
        assert!(RetryPolicy::new(1)
            .with_initial_delay(Duration::from_secs(60))
            .validate()
            .is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_retries: 1\ninitial_delay_ms: 10\n").unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay_ms, 10);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.backoff_factor, 2.0);
    }
}

//! Exponential backoff between admission attempts

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy applied when no device can admit an operation
///
/// Only exhaustion is retried this way; placement errors fail immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum admission retries after the first attempt
    pub max_retries: usize,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Multiplier applied per retry
    pub backoff_multiplier: f64,

    /// Upper bound on a single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Add up to 25% jitter so waiting workers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 10,
            backoff_multiplier: 2.0,
            max_delay_ms: 1000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail on the first rejected admission
    pub fn no_retry() -> Self {
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        if !self.jitter {
            return Duration::from_millis(delay_ms);
        }

        let jitter_range = delay_ms / 4;
        let jitter_amt = if jitter_range > 0 {
            rand::random::<u64>() % jitter_range
        } else {
            0
        };
        Duration::from_millis(delay_ms + jitter_amt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 10);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.max_delay_ms, 1000);
        assert!(config.jitter);
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let config = RetryConfig::new()
            .with_initial_delay_ms(10)
            .with_backoff_multiplier(2.0)
            .with_max_delay_ms(100)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0).as_millis(), 10);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 20);
        assert_eq!(config.delay_for_attempt(2).as_millis(), 40);
        assert_eq!(config.delay_for_attempt(10).as_millis(), 100);
        assert_eq!(config.delay_for_attempt(usize::MAX).as_millis(), 100);
    }

    #[test]
    fn test_jitter_in_range() {
        let config = RetryConfig::new()
            .with_initial_delay_ms(100)
            .with_backoff_multiplier(1.0)
            .with_max_delay_ms(200)
            .with_jitter(true);

        for _ in 0..20 {
            let delay = config.delay_for_attempt(0).as_millis();
            assert!((100..125).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.initial_delay_ms, 10);
    }
}

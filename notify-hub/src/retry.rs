//! Retry policies.
//!
//! A [`RetryPolicy`] answers two questions for the async path: may this failure
//! be retried, and how long to wait before the next attempt. Policies hold no
//! mutable state, so one instance is shared by every worker.

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, PlatformError};
use crate::{Error, Result};

/// Backoff family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `base × attempt`.
    Linear,
    /// `base × multiplier^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Retry defaults as plain configuration data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff family.
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Random jitter as a fraction of the delay, only ever added (0.25 = up to +25%).
    pub jitter: f64,
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 60000,
            multiplier: 2.0,
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::config(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.strategy == BackoffStrategy::Exponential && self.multiplier < 1.0 {
            return Err(Error::config(format!(
                "retry.multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::config(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Stateless retry strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: 3,
        }
    }

    /// Delay grows by `base` with every attempt.
    pub fn linear(base: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay: base,
            max_delay: base.saturating_mul(10),
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: 3,
        }
    }

    /// Delay multiplies by `multiplier` with every attempt.
    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: base,
            max_delay: Duration::from_secs(60),
            multiplier: multiplier.max(1.0),
            jitter: 0.0,
            max_attempts: 3,
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO).with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Add up to `fraction` of random jitter on top of every delay.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a failure of this category may be retried at all.
    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        category.is_transient()
    }

    /// Whether another attempt should follow `attempts_made` attempts that
    /// ended with `error`.
    pub fn should_retry(&self, error: &PlatformError, attempts_made: u32) -> bool {
        self.is_retryable(error.category) && attempts_made < self.max_attempts
    }

    /// Backoff delay after `attempt` attempts (1-based), without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * attempt as f64,
            BackoffStrategy::Exponential => {
                base_ms * self.multiplier.powi(attempt.saturating_sub(1).min(63) as i32)
            }
        };
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Backoff delay after `attempt` attempts (1-based), jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_for_attempt(attempt).as_millis() as u64;

        let jitter_range = (delay_ms as f64 * self.jitter) as u64;
        let jittered = if jitter_range > 0 {
            delay_ms + rand::rng().random_range(0..=jitter_range)
        } else {
            delay_ms
        };

        // Never below the backoff delay itself, never above the cap.
        let max_ms = (self.max_delay.as_millis() as u64).max(delay_ms);
        Duration::from_millis(jittered.min(max_ms))
    }

    /// Delay before retrying `error`; a platform-supplied hint wins over the
    /// policy.
    pub fn next_delay(&self, attempt: u32, error: &PlatformError) -> Duration {
        match error.retry_after() {
            Some(hint) => hint,
            None => self.delay_for_attempt(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.strategy, BackoffStrategy::Exponential);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_validate() {
        let config = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RetryConfig {
            jitter: 2.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250));
        for attempt in 1..5 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::linear(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), 2.0)
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.25);
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1).as_millis();
            assert!((1000..=1250).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_default_jitter_never_shortens_delay() {
        let policy = RetryPolicy::from(&RetryConfig {
            base_delay_ms: 100,
            ..RetryConfig::default()
        });
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100), "delay {delay:?} below base");
            assert!(delay <= Duration::from_millis(125), "delay {delay:?} above jitter");
        }
    }

    #[test]
    fn test_retryable_categories() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(ErrorCategory::Network));
        assert!(policy.is_retryable(ErrorCategory::Timeout));
        assert!(policy.is_retryable(ErrorCategory::RateLimited));
        assert!(policy.is_retryable(ErrorCategory::PlatformUnavailable));
        assert!(!policy.is_retryable(ErrorCategory::Validation));
        assert!(!policy.is_retryable(ErrorCategory::Auth));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        let err = PlatformError::network("reset");
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
        assert!(!policy.should_retry(&PlatformError::auth("denied"), 1));
    }

    #[test]
    fn test_retry_after_overrides_policy() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10));
        let err = PlatformError::rate_limited("429", Some(Duration::from_secs(3)));
        assert_eq!(policy.next_delay(1, &err), Duration::from_secs(3));
        let err = PlatformError::network("reset");
        assert_eq!(policy.next_delay(1, &err), Duration::from_millis(10));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(&PlatformError::network("x"), 1));
    }
}

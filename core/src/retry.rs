//! Retry policy for idempotent gateway calls.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// Only applied to operations that are safe to repeat, such as transaction
/// finalization, which the gateway treats idempotently.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt should follow `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay before retrying after `attempt` (1-based), with up to
    /// 10% random jitter to avoid thundering herds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..=0.1) * capped;
        Duration::from_secs_f64(capped + jitter)
    }
}

//! Retry policy for calls to the billing service.
//!
//! The retry budget sits *inside* the circuit breaker: one admitted call
//! may attempt the transport up to `max_attempts` times on transient
//! failures, and exhausting the budget counts as a single failure signal
//! toward the breaker. Explicit rejections from the remote are never
//! retried.
//!
//! Backoff between attempts is capped exponential:
//!
//! ```text
//! delay(n) = min(initial_delay * backoff_factor^n, max_delay)
//! ```

use std::time::Duration;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts per logical call (first try included).
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Timeout applied to each individual transport attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Minimal delays for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_millis(50),
        }
    }

    /// Calculate the delay before retry attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

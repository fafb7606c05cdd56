//! Exponential backoff for `retry:<n>` failure policies.
//!
//! The delay doubles on every attempt starting from a configurable base.
//! Attempts are 1-based: the delay before re-invoking after the first failed
//! attempt is the base delay itself.

use std::time::Duration;

/// Doubling backoff used between retry attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    base: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Delay to sleep before attempt `attempt + 1`, given that `attempt`
    /// (1-based) just failed: `base * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

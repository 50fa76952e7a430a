//! Reconnect backoff scheduling.
//!
//! Exponential backoff capped at a maximum delay, with a hard limit on the
//! number of attempts. Once the limit is reached no further reconnect is
//! scheduled and the session stays in the terminal error state until an
//! explicit `force_reconnect`.

use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (zero-based).
///
/// Formula: `min(base * 2^attempt, max)`. Overflow saturates to `max`.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt);
    factor
        .and_then(|f| base.checked_mul(f))
        .map_or(max, |delay| delay.min(max))
}

/// Reconnect attempt counter with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Create a scheduler with zero attempts made.
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
            attempt: 0,
        }
    }

    /// Delay for the next reconnect, or `None` when retries are exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.is_exhausted() {
            None
        } else {
            Some(reconnect_delay(self.base, self.max, self.attempt))
        }
    }

    /// Record that a scheduled reconnect fired.
    pub fn record_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Forget previous attempts (after a successful connect or a forced reconnect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Whether no further reconnect may be scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Configured attempt limit.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Apply new limits, keeping the current attempt count.
    pub fn reconfigure(&mut self, base: Duration, max: Duration, max_retries: u32) {
        self.base = base;
        self.max = max;
        self.max_retries = max_retries;
    }
}

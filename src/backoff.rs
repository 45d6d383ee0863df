//! Exponential backoff shared by queue retries and listener reconnects.

use std::time::Duration;

/// `base_delay × 2^attempt`, capped at `max_delay`, with a shared attempt cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

/// Completion jobs are dropped after this many failed syncs
pub const MAX_RETRIES: u32 = 10;

/// Listeners stop reconnecting after this many consecutive failures
pub const MAX_RECONNECTION_ATTEMPTS: u32 = 5;

impl BackoffPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Policy for completion job retries
    pub const fn queue_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), MAX_RETRIES)
    }

    /// Policy for listener reconnects
    pub const fn listener_default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            MAX_RECONNECTION_ATTEMPTS,
        )
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::queue_default()
    }
}

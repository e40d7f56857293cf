// Reconnect backoff policy

use std::time::Duration;

/// Bounded exponential backoff for the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect after a failure
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based):
    /// `min(base * 2^(failures - 1), max)`
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        let factor = 2u32
            .checked_pow(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt given the failures counted so far,
    /// or `None` once attempts are exhausted
    pub fn next_delay(&self, failures_so_far: u32) -> Option<Duration> {
        (failures_so_far < self.max_attempts)
            .then(|| self.delay_for_failure(failures_so_far + 1))
    }
}

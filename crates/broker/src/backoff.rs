//! Bounded exponential backoff for the self-test dial.

use std::time::Duration;

/// Retry schedule for dialing the broker's own listening socket before
/// announcing it to the kubelet: delays double from `initial_delay` up
/// to `max_delay`, at most `max_attempts` dials, the whole loop bounded
/// by `overall_timeout`.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub overall_timeout: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            max_attempts: 40,
            overall_timeout: Duration::from_secs(5),
        }
    }
}

impl BackoffSchedule {
    /// Delay to sleep after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

//! Shared WebSocket reconnection policy.

use rand::Rng;
use std::time::Duration;

/// A read that sees nothing for this long forces a reconnect.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): a uniform draw
    /// from [0, min(cap, base * 2^(attempt-1))].
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.cap);
        rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_bounded_by_cap() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..=20 {
            assert!(policy.delay(attempt) <= policy.cap);
        }
    }

    #[test]
    fn test_early_attempts_stay_small() {
        let policy = ReconnectPolicy::default();
        for _ in 0..50 {
            assert!(policy.delay(1) <= Duration::from_secs(1));
            assert!(policy.delay(2) <= Duration::from_secs(2));
        }
    }
}

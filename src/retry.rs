//! Bounded exponential backoff shared by the oracle and the executor

use std::time::Duration;

/// Doubling delay schedule capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current_attempt: 0,
        }
    }

    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        )
    }

    /// Delay before the next retry; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.current_attempt).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(factor).min(self.max);

        self.current_attempt = self.current_attempt.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut backoff = ExponentialBackoff::from_millis(100, 10_000);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff = ExponentialBackoff::from_millis(100, 1_000);

        for _ in 0..40 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}

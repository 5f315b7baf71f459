//! Exponential backoff with jitter for retried attempts.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped = exponential.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 && capped > 0 {
            rand::thread_rng().gen_range(0..=capped.saturating_mul(self.jitter_percent) / 100)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(100, 10_000).with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn test_max_cap() {
        let backoff = ExponentialBackoff::new(100, 1000).with_jitter(0);
        assert_eq!(backoff.delay(10).as_millis(), 1000);
    }

    #[test]
    fn test_jitter_bounded() {
        let backoff = ExponentialBackoff::new(100, 1000);
        for attempt in 0..5 {
            let d = backoff.delay(attempt).as_millis() as u64;
            let base = (100u64 << attempt).min(1000);
            assert!(d >= base && d <= base + base / 10);
        }
    }

    #[test]
    fn test_zero_base() {
        let backoff = ExponentialBackoff::new(0, 1000);
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }

    #[test]
    fn test_huge_bounds_saturate() {
        let backoff = ExponentialBackoff::new(u64::MAX / 2, u64::MAX);
        assert!(backoff.delay(30) >= Duration::from_millis(u64::MAX / 2));
    }
}

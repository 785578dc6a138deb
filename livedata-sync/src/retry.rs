//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// The first `min_count` attempts wait `min_timeout_ms`; after that the
/// delay grows as `base * exponent^count`, capped at `max_timeout_ms`, and
/// is scaled by a random factor in `[1 - fuzz/2, 1 + fuzz/2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_timeout_ms: u64,
    pub exponent: f64,
    pub max_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub min_count: u32,
    pub fuzz: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 1000,
            exponent: 2.2,
            max_timeout_ms: 5 * 60 * 1000,
            min_timeout_ms: 10,
            min_count: 2,
            fuzz: 0.5,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self, count: u32) -> Duration {
        self.delay_with_fraction(count, rand::thread_rng().gen::<f64>())
    }

    /// Delay for a given jitter draw in `[0, 1)`.
    pub fn delay_with_fraction(&self, count: u32, fraction: f64) -> Duration {
        if count < self.min_count {
            return Duration::from_millis(self.min_timeout_ms);
        }
        let raw = (self.base_timeout_ms as f64 * self.exponent.powi(count as i32)).min(self.max_timeout_ms as f64);
        let jittered = raw * (fraction * self.fuzz + (1.0 - self.fuzz / 2.0));
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempts_are_fast() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay(0), Duration::from_millis(10));
        assert_eq!(retry.delay(1), Duration::from_millis(10));
    }

    #[test]
    fn test_growth_and_cap() {
        let retry = RetryConfig::default();
        // 1000 * 2.2^2 = 4840, jitter factor at fraction 0.5 is exactly 1.
        assert_eq!(retry.delay_with_fraction(2, 0.5), Duration::from_millis(4840));
        assert_eq!(retry.delay_with_fraction(3, 0.0), Duration::from_millis(7986));
        assert_eq!(retry.delay_with_fraction(30, 0.5), Duration::from_millis(300_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let retry = RetryConfig::default();
        for _ in 0..100 {
            let d = retry.delay(4).as_millis() as f64;
            let raw = 1000.0 * 2.2f64.powi(4);
            assert!(d >= raw * 0.75 - 1.0 && d < raw * 1.25);
        }
    }
}

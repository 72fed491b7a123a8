use rand::Rng;
use std::time::Duration;

/// Exponential retry backoff with full jitter, capped.
///
/// The delay before attempt `n` (1-based) is drawn uniformly from
/// `[base * 2^(n-1) / 2, base * 2^(n-1)]`, clamped to `cap`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            cap,
        }
    }

    /// Upper bound of the delay window for a given attempt
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.cap)
    }

    /// Jittered delay before the given attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let span = ceiling.saturating_sub(half);
        if span.is_zero() {
            return ceiling;
        }
        let jitter = rand::thread_rng().gen_range(0..=span.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(2), Duration::from_secs(2));
        assert_eq!(policy.ceiling(3), Duration::from_secs(4));
        assert_eq!(policy.ceiling(7), Duration::from_secs(60));
        assert_eq!(policy.ceiling(30), Duration::from_secs(60));
    }

    #[test]
    fn delay_stays_within_window() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
        for attempt in 1..=10 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= ceiling / 2, "attempt {}: {:?}", attempt, delay);
                assert!(delay <= ceiling, "attempt {}: {:?}", attempt, delay);
            }
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_secs(300));
    }
}

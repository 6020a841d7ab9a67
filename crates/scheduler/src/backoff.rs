//! Retry backoff policy (spec.md §5 "Retries": `min(cap, base*2^(n-1)) + jitter`).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(5), cap: Duration::from_secs(5 * 60) }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry attempt `attempt` (1-indexed: the delay awaited
    /// before the 2nd try is `backoff(1)`).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1).min(32));
        let scaled = self.base.as_millis() as u64;
        let capped = scaled.saturating_mul(exp).min(self.cap.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=self.base.as_millis() as u64);
        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_backoff_is_bounded_by_base_and_twice_base() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay(1);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_secs(10));
    }

    #[test]
    fn backoff_grows_but_never_exceeds_cap_plus_base() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay(20);
        assert!(delay <= Duration::from_secs(5 * 60 + 5));
        assert!(delay >= Duration::from_secs(5 * 60));
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing_across_low_attempts() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300));
        assert!(policy.delay(1) <= policy.delay(2) + Duration::from_secs(5));
        assert!(policy.delay(2) <= policy.delay(3) + Duration::from_secs(5));
    }
}

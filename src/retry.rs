// Reified retry/backoff policy shared by the provider router and the
// storage upload stage.

use std::time::Duration;
use rand::Rng;

/// Exponential backoff with full jitter: the wait before attempt `n`
/// (1-based, so the wait happens before attempts 2..=max) is drawn uniformly
/// from `[0, base * 2^(n-1)]`. A provider-supplied `retry_after` acts as a
/// floor on the sampled wait.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_ms: u64) -> Self {
        BackoffPolicy {
            max_attempts: max_attempts.max(1),
            base: Duration::from_millis(base_ms),
        }
    }

    /// Upper bound of the jitter window before attempt `next_attempt`.
    pub fn window_for(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Sample the wait before `next_attempt`, honoring `retry_after` as a
    /// floor when the backend asked for one.
    pub fn sample_wait(&self, next_attempt: u32, retry_after: Option<Duration>) -> Duration {
        let window = self.window_for(next_attempt);
        let sampled = if window.is_zero() {
            Duration::ZERO
        } else {
            let upper = window.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=upper))
        };
        match retry_after {
            Some(floor) if floor > sampled => floor,
            _ => sampled,
        }
    }

    pub fn attempts_left(&self, attempt_no: u32) -> bool {
        attempt_no < self.max_attempts
    }
}

/// Fixed-delay retry used where exponential growth buys nothing: caption
/// calls (2 attempts, 500 ms apart) and storage uploads (2 retries, 1 s
/// apart).
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        FixedRetry { max_attempts: max_attempts.max(1), delay }
    }

    pub fn captions() -> Self {
        FixedRetry::new(2, Duration::from_millis(500))
    }

    pub fn uploads() -> Self {
        // 1 initial try + 2 retries
        FixedRetry::new(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_doubles_per_attempt() {
        let policy = BackoffPolicy::new(3, 1000);
        assert_eq!(policy.window_for(1), Duration::from_millis(1000));
        assert_eq!(policy.window_for(2), Duration::from_millis(2000));
        assert_eq!(policy.window_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_sampled_wait_stays_inside_window() {
        let policy = BackoffPolicy::new(3, 1000);
        for attempt in 1..=3 {
            for _ in 0..50 {
                let wait = policy.sample_wait(attempt, None);
                assert!(wait <= policy.window_for(attempt));
            }
        }
    }

    #[test]
    fn test_retry_after_floors_the_wait() {
        let policy = BackoffPolicy::new(3, 10);
        let floor = Duration::from_secs(5);
        for _ in 0..20 {
            let wait = policy.sample_wait(1, Some(floor));
            assert!(wait >= floor);
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = BackoffPolicy::new(3, 1000);
        assert!(policy.attempts_left(1));
        assert!(policy.attempts_left(2));
        assert!(!policy.attempts_left(3));
    }

    #[test]
    fn test_fixed_retry_presets() {
        let captions = FixedRetry::captions();
        assert_eq!(captions.max_attempts, 2);
        assert_eq!(captions.delay, Duration::from_millis(500));
        let uploads = FixedRetry::uploads();
        assert_eq!(uploads.max_attempts, 3);
        assert_eq!(uploads.delay, Duration::from_secs(1));
    }
}

use rand::Rng;
use std::time::Duration;

use crate::error::{ErrorKind, JobError};

/// Default base delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default cap on any single retry delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default number of attempts a failing job gets.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Malformed frames are retried once, regardless of earlier failures.
pub const MAX_PARSE_RETRIES: u32 = 1;

/// Retry/backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before a failing job is left in `Error`.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each later one.
    pub base_delay: Duration,
    /// Hard cap on the exponential delay (before jitter).
    pub max_delay: Duration,
    /// Upper bound of the random jitter, as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// `parse_failures` counts the malformed-frame failures of this job so
    /// far, including `error` itself. Only the first one is retried.
    pub fn should_retry(&self, error: &JobError, attempts: u32, parse_failures: u32) -> bool {
        if error.kind == ErrorKind::Parse && parse_failures > MAX_PARSE_RETRIES {
            return false;
        }
        should_retry(error, attempts, self.max_retries)
    }

    /// Exponential delay for `retry_count`, capped, without jitter.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        Duration::from_millis(calculate_retry_delay_with_max(
            duration_ms(self.base_delay),
            retry_count,
            duration_ms(self.max_delay),
        ))
    }

    /// Delay to wait before retry number `retry_count + 1`.
    ///
    /// A server-supplied `retry_after` hint replaces the exponential delay
    /// when it is longer, still bounded by `max_delay`.
    pub fn delay_for(&self, retry_count: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.base_delay_for(retry_count);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.max_delay));
        }
        with_jitter(delay, self.jitter_ratio)
    }
}

/// Decide whether a failed attempt gets another try.
///
/// `attempts` is the number of attempts already made, so a job that keeps
/// failing is tried exactly `max_retries` times. `Auth` and `Config`
/// failures never retry.
pub fn should_retry(error: &JobError, attempts: u32, max_retries: u32) -> bool {
    if attempts >= max_retries {
        return false;
    }
    match error.kind {
        ErrorKind::Auth | ErrorKind::Config => false,
        ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::Api | ErrorKind::Parse => {
            error.retryable
        }
    }
}

/// `min(base_ms * 2^retry_count, 30_000)` in milliseconds.
pub fn calculate_retry_delay(base_ms: u64, retry_count: u32) -> u64 {
    calculate_retry_delay_with_max(base_ms, retry_count, DEFAULT_MAX_DELAY_MS)
}

/// `min(base_ms * 2^retry_count, max_ms)` in milliseconds.
pub fn calculate_retry_delay_with_max(base_ms: u64, retry_count: u32, max_ms: u64) -> u64 {
    // 2^retry_count saturates rather than overflowing for absurd counts.
    let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    base_ms.saturating_mul(multiplier).min(max_ms)
}

/// Add uniform random jitter in `[0, delay * ratio]`.
fn with_jitter(delay: Duration, ratio: f64) -> Duration {
    let max_jitter_ms = (duration_ms(delay) as f64 * ratio) as u64;
    if max_jitter_ms == 0 {
        return delay;
    }
    let jitter_ms = rand::rng().random_range(0..=max_jitter_ms);
    delay + Duration::from_millis(jitter_ms)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(kind: ErrorKind) -> JobError {
        JobError::new(kind, "boom", 0)
    }

    #[test]
    fn test_backoff_growth() {
        assert_eq!(calculate_retry_delay(1000, 0), 1000);
        assert_eq!(calculate_retry_delay(1000, 1), 2000);
        assert_eq!(calculate_retry_delay(1000, 2), 4000);
        assert_eq!(calculate_retry_delay(1000, 5), 30_000);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(calculate_retry_delay(1000, 200), 30_000);
        assert_eq!(calculate_retry_delay_with_max(u64::MAX, 3, 5_000), 5_000);
    }

    #[test]
    fn test_should_retry_respects_limit() {
        let err = error(ErrorKind::Network);
        assert!(should_retry(&err, 1, 3));
        assert!(should_retry(&err, 2, 3));
        assert!(!should_retry(&err, 3, 3));
        assert!(!should_retry(&err, 1, 1));
        assert!(!should_retry(&err, 1, 0));
    }

    #[test]
    fn test_should_retry_never_for_auth_or_config() {
        let mut auth = error(ErrorKind::Auth);
        auth.retryable = true;
        assert!(!should_retry(&auth, 0, 3));
        assert!(!should_retry(&error(ErrorKind::Config), 0, 3));
    }

    #[test]
    fn test_should_retry_follows_retryable_flag() {
        let mut api = error(ErrorKind::Api);
        assert!(should_retry(&api, 0, 3));
        api.retryable = false;
        assert!(!should_retry(&api, 0, 3));
    }

    #[test]
    fn test_parse_errors_retry_once() {
        let policy = RetryPolicy::default();
        let err = error(ErrorKind::Parse);
        assert!(policy.should_retry(&err, 1, 1));
        assert!(!policy.should_retry(&err, 2, 2));
    }

    #[test]
    fn test_parse_retry_ignores_earlier_transient_failures() {
        let policy = RetryPolicy::default().with_max_retries(4);
        let err = error(ErrorKind::Parse);
        // Two network failures, then the first malformed frame.
        assert!(policy.should_retry(&err, 3, 1));
        assert!(!policy.should_retry(&err, 4, 1));
    }

    #[test]
    fn test_policy_limit_counts_attempts() {
        let policy = RetryPolicy::default().with_max_retries(3);
        let err = error(ErrorKind::Network);
        assert!(policy.should_retry(&err, 1, 0));
        assert!(policy.should_retry(&err, 2, 0));
        assert!(!policy.should_retry(&err, 3, 0));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for retry_count in 0..6 {
            let base = policy.base_delay_for(retry_count);
            let delay = policy.delay_for(retry_count, None);
            assert!(delay >= base);
            assert!(delay <= base + base / 10, "{:?} vs {:?}", delay, base);
        }
    }

    #[test]
    fn test_retry_after_hint_is_respected_and_capped() {
        let policy = RetryPolicy::default().with_jitter_ratio(0.0);
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
        // A shorter hint does not undercut the exponential delay.
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(10))),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
    }
}

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default maximum wait between two stream frames.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Configuration for the queue manager.
///
/// Use [`QueueConfig::builder()`] for ergonomic construction, or
/// [`QueueConfig::default()`] for the defaults (3 concurrent jobs, 30s frame
/// timeout, 3 attempts with 1s..30s backoff between them).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of jobs streaming at once (at least 1).
    pub max_concurrent: usize,

    /// Maximum time between successive frames, not total stream duration.
    pub request_timeout: Duration,

    /// Automatic retry behavior for transient failures.
    pub retry: RetryPolicy,

    /// Buffer size of the event broadcast channel. Slow subscribers that fall
    /// further behind than this miss events (see `RecvError::Lagged`).
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }
}

/// Builder for [`QueueConfig`].
#[derive(Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Set the concurrency ceiling. Values below 1 are raised to 1.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max.max(1);
        self
    }

    /// Set the maximum wait between frames.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Replace the whole retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the number of attempts a failing job gets.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    /// Set the broadcast buffer used for subscriptions.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Build the final [`QueueConfig`].
    pub fn build(self) -> QueueConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::builder()
            .with_max_concurrent(5)
            .with_request_timeout(Duration::from_secs(10))
            .with_max_retries(1)
            .with_event_capacity(16)
            .build();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn test_zero_concurrency_is_raised() {
        let config = QueueConfig::builder().with_max_concurrent(0).build();
        assert_eq!(config.max_concurrent, 1);
    }
}

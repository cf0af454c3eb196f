use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the rewrite pipeline.
#[derive(Error, Debug)]
pub enum RewriteError {
    /// Connection-level failure (DNS, reset, stream closed early).
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// No frame arrived within the configured request timeout.
    #[error("No frame received within {0:?}")]
    Timeout(Duration),

    /// Missing credential, or the remote service rejected it (401/403).
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A streamed frame could not be decoded.
    #[error("Malformed frame: {0}")]
    Parse(String),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },
}

impl RewriteError {
    /// Classify this error into the job-level taxonomy.
    ///
    /// Returns `None` for errors that never become a job failure
    /// (cancellation, lookups, state machine misuse).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RewriteError::Network(_) | RewriteError::Request(_) | RewriteError::Timeout(_) => {
                Some(ErrorKind::Network)
            }
            RewriteError::Auth(_) => Some(ErrorKind::Auth),
            RewriteError::RateLimited { .. } => Some(ErrorKind::RateLimit),
            RewriteError::Api { .. } => Some(ErrorKind::Api),
            RewriteError::InvalidConfig(_) => Some(ErrorKind::Config),
            RewriteError::Parse(_) | RewriteError::Json(_) => Some(ErrorKind::Parse),
            RewriteError::Cancelled
            | RewriteError::NotFound(_)
            | RewriteError::InvalidTransition { .. } => None,
        }
    }

    /// Whether the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(ErrorKind::is_transient)
    }

    /// Server-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RewriteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RewriteError>;

/// Job-level error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Network,
    Auth,
    RateLimit,
    Api,
    Config,
    Parse,
}

impl ErrorKind {
    /// `Auth` and `Config` failures will not go away on their own.
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorKind::Auth | ErrorKind::Config)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Api => "api",
            ErrorKind::Config => "config",
            ErrorKind::Parse => "parse",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure record stored on a job in the `Error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_count: u32,
    pub retryable: bool,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_count,
            retryable: kind.is_transient(),
        }
    }

    /// Build a record from a pipeline error. Errors outside the job taxonomy
    /// are recorded as non-retryable API failures.
    pub fn from_error(err: &RewriteError, retry_count: u32) -> Self {
        match err.kind() {
            Some(kind) => Self {
                kind,
                message: err.to_string(),
                retry_count,
                retryable: err.is_retryable(),
            },
            None => Self {
                kind: ErrorKind::Api,
                message: err.to_string(),
                retry_count,
                retryable: false,
            },
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error after {} retries: {}",
            self.kind, self.retry_count, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RewriteError::Timeout(Duration::from_secs(1)).kind(),
            Some(ErrorKind::Network)
        );
        assert_eq!(
            RewriteError::Auth("missing key".into()).kind(),
            Some(ErrorKind::Auth)
        );
        assert_eq!(
            RewriteError::RateLimited { retry_after: None }.kind(),
            Some(ErrorKind::RateLimit)
        );
        assert_eq!(
            RewriteError::Parse("bad".into()).kind(),
            Some(ErrorKind::Parse)
        );
        assert_eq!(RewriteError::Cancelled.kind(), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RewriteError::Network("reset".into()).is_retryable());
        assert!(RewriteError::Api {
            status: 500,
            body: String::new()
        }
        .is_retryable());
        assert!(!RewriteError::Auth("401".into()).is_retryable());
        assert!(!RewriteError::InvalidConfig("temperature".into()).is_retryable());
        assert!(!RewriteError::Cancelled.is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = RewriteError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(RewriteError::Network("x".into()).retry_after(), None);
    }

    #[test]
    fn test_job_error_from_error() {
        let err = RewriteError::Api {
            status: 502,
            body: "bad gateway".into(),
        };
        let record = JobError::from_error(&err, 2);
        assert_eq!(record.kind, ErrorKind::Api);
        assert_eq!(record.retry_count, 2);
        assert!(record.retryable);
        assert_eq!(record.message, "API returned HTTP 502: bad gateway");
    }

    #[test]
    fn test_error_display() {
        let err = RewriteError::InvalidTransition {
            job_id: "p1".into(),
            from: "complete",
            to: "processing",
        };
        assert_eq!(err.to_string(), "Job p1 cannot move from complete to processing");
        assert_eq!(RewriteError::Cancelled.to_string(), "Job was cancelled");
    }
}

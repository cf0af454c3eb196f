use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, Result, RewriteError};
use crate::progress::StreamProgress;

/// Dispatch priority. Higher priorities are dispatched first; within a tier
/// jobs go in `enqueued_at` order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Job lifecycle.
///
/// `Pending -> Queued -> Processing -> Streaming -> {Complete | Error | Cancelled}`.
/// `Error` loops back to `Processing` when a retry is performed, and
/// `Queued -> Pending` happens only on an explicit dequeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Streaming,
    Complete,
    Error(JobError),
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Streaming => "streaming",
            JobStatus::Complete => "complete",
            JobStatus::Error(_) => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// `Processing` or `Streaming`: a stream processor is bound to the job.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Streaming)
    }

    /// No transition leaves `Complete` or `Cancelled`. `Error` is only final
    /// once the job has left the queue, which the queue manager decides.
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: &JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Queued),
            Queued => matches!(next, Pending | Processing | Cancelled),
            Processing => matches!(next, Streaming | Error(_) | Cancelled),
            Streaming => matches!(next, Complete | Error(_) | Cancelled),
            Error(_) => matches!(next, Processing | Cancelled),
            Complete | Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of text queued for remote rewriting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub source_text: String,
    pub result_text: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Automatic retries performed so far.
    pub retry_count: u32,
    /// Latest progress sample of the current stream.
    pub progress: Option<StreamProgress>,
    #[serde(skip)]
    pub(crate) cancel_token: CancellationToken,
}

impl Job {
    /// Create a pending job with a generated id and `Normal` priority.
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_text: source_text.into(),
            result_text: String::new(),
            status: JobStatus::Pending,
            priority: Priority::Normal,
            enqueued_at: None,
            processing_started_at: None,
            completed_at: None,
            retry_count: 0,
            progress: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Use the producer's unit id (paragraph or selection id) as the job id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Pin the FIFO timestamp. Left unset, it is stamped on enqueue.
    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }

    pub fn error(&self) -> Option<&JobError> {
        match &self.status {
            JobStatus::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Wall-clock time between the first dispatch and completion.
    pub fn processing_time_ms(&self) -> Option<u64> {
        let started = self.processing_started_at?;
        let finished = self.completed_at?;
        u64::try_from((finished - started).num_milliseconds()).ok()
    }

    /// Move to `next`, maintaining the pipeline-owned timestamps.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(RewriteError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }

        let now = Utc::now();
        match &next {
            JobStatus::Pending => self.enqueued_at = None,
            JobStatus::Queued => {
                self.enqueued_at.get_or_insert(now);
            }
            JobStatus::Processing => {
                self.processing_started_at.get_or_insert(now);
                self.completed_at = None;
            }
            JobStatus::Complete | JobStatus::Error(_) | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Streaming => {}
        }
        self.status = next;
        Ok(())
    }

    /// A fresh pending copy for a manual retry: same id, text and priority.
    pub(crate) fn fresh_copy(&self, keep_retry_count: bool) -> Job {
        let mut job = Job::new(self.source_text.clone())
            .with_id(self.id.clone())
            .with_priority(self.priority);
        if keep_retry_count {
            job.retry_count = self.retry_count;
        }
        job
    }
}

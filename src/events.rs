use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::progress::StreamProgress;

/// State changes broadcast to subscribers (renderers, producers).
///
/// Every event carries the job id; the full job can be fetched with
/// [`QueueManager::job()`](crate::QueueManager::job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueEvent {
    /// Admitted to the queue.
    #[serde(rename_all = "camelCase")]
    Queued { job_id: String },

    /// Removed before dispatch and returned to `Pending`.
    #[serde(rename_all = "camelCase")]
    Dequeued { job_id: String },

    /// Dispatched into a slot. `attempt` starts at 1.
    ///
    /// An attempt above 1 opens a fresh stream: the job's result text is
    /// cleared and progress restarts from 0, so renderers should reset too.
    #[serde(rename_all = "camelCase")]
    Started { job_id: String, attempt: u32 },

    /// First frame received.
    #[serde(rename_all = "camelCase")]
    Streaming { job_id: String },

    /// Text appended to the job's result.
    #[serde(rename_all = "camelCase")]
    Delta {
        job_id: String,
        delta: String,
        progress: StreamProgress,
    },

    /// Attempt failed with a transient error; the job keeps its slot.
    #[serde(rename_all = "camelCase")]
    RetryScheduled {
        job_id: String,
        error: JobError,
        delay_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        result_text: String,
        progress: StreamProgress,
    },

    /// Retries exhausted or the error is not retryable.
    #[serde(rename_all = "camelCase")]
    Failed { job_id: String, error: JobError },

    #[serde(rename_all = "camelCase")]
    Cancelled { job_id: String },
}

impl QueueEvent {
    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::Queued { job_id }
            | QueueEvent::Dequeued { job_id }
            | QueueEvent::Started { job_id, .. }
            | QueueEvent::Streaming { job_id }
            | QueueEvent::Delta { job_id, .. }
            | QueueEvent::RetryScheduled { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Cancelled { job_id } => job_id,
        }
    }
}

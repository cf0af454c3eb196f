use futures::StreamExt;
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{CompletionBackend, CompletionRequest, Frame};
use crate::error::{ErrorKind, JobError, Result, RewriteError};
use crate::progress::{ProgressEstimator, StreamProgress};
use crate::queue::{Dispatch, Shared};

/// Runs one dispatched job end to end: open the stream, apply frames,
/// retry transient failures while holding the slot, and report the outcome
/// back to the queue.
///
/// Every write goes through the queue under the job's lease, so once the job
/// is cancelled (or otherwise leaves the queue) nothing this processor does
/// can touch it again.
pub(crate) struct StreamProcessor<B: CompletionBackend> {
    shared: Arc<Shared<B>>,
    job_id: String,
    lease: u64,
    cancel: CancellationToken,
}

impl<B: CompletionBackend> StreamProcessor<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>, dispatch: Dispatch) -> Self {
        Self {
            shared,
            job_id: dispatch.job_id,
            lease: dispatch.lease,
            cancel: dispatch.cancel,
        }
    }

    pub(crate) async fn run(self) {
        let mut parse_failures = 0;
        loop {
            let Some((request, retry_count)) = self.shared.request_for(&self.job_id, self.lease)
            else {
                return;
            };

            let err = match self.attempt(request).await {
                Ok(progress) => {
                    self.shared.complete(&self.job_id, self.lease, progress);
                    return;
                }
                Err(RewriteError::Cancelled) => {
                    debug!(job_id = %self.job_id, "Stream processor observed cancellation");
                    return;
                }
                Err(err) => err,
            };

            let policy = &self.shared.config.retry;
            let error = JobError::from_error(&err, retry_count);
            if error.kind == ErrorKind::Parse {
                parse_failures += 1;
            }
            if !policy.should_retry(&error, retry_count + 1, parse_failures) {
                self.shared.fail(&self.job_id, self.lease, error);
                return;
            }

            let delay = policy.delay_for(retry_count, err.retry_after());
            warn!(
                job_id = %self.job_id,
                attempt = retry_count + 1,
                max_retries = policy.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retrying after transient error"
            );
            if !self
                .shared
                .schedule_retry(&self.job_id, self.lease, error, delay)
            {
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.shared.resume_after_backoff(&self.job_id, self.lease) {
                return;
            }
        }
    }

    /// One attempt. Returns the final progress sample on the end marker.
    async fn attempt(&self, request: CompletionRequest) -> Result<StreamProgress> {
        request.config.validate()?;

        let frame_timeout = self.shared.config.request_timeout;
        let mut estimator = ProgressEstimator::new(request.source_text.len());
        let opened_at = Instant::now();

        let mut frames = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RewriteError::Cancelled),
            opened = timeout(frame_timeout, self.shared.backend.open(request)) => {
                opened.map_err(|_| RewriteError::Timeout(frame_timeout))??
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RewriteError::Cancelled),
                next = timeout(frame_timeout, frames.next()) => next,
            };

            match next {
                Err(_) => return Err(RewriteError::Timeout(frame_timeout)),
                Ok(None) => {
                    return Err(RewriteError::Network(
                        "stream closed before the end marker".to_string(),
                    ))
                }
                Ok(Some(frame)) => match frame? {
                    Frame::Delta(text) => {
                        let progress = estimator.record(text.len(), opened_at.elapsed());
                        self.shared
                            .append_delta(&self.job_id, self.lease, text, progress)?;
                    }
                    Frame::Done => return Ok(estimator.finish()),
                },
            }
        }
    }
}

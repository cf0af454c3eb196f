use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{CompletionBackend, CompletionConfig, CompletionRequest, HttpBackend};
use crate::config::QueueConfig;
use crate::error::{JobError, Result, RewriteError};
use crate::events::QueueEvent;
use crate::job::{Job, JobStatus, Priority};
use crate::progress::StreamProgress;
use crate::stream::StreamProcessor;

/// Aggregate counters, updated on every terminal transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Jobs waiting for a slot.
    pub queued: usize,
    /// Slots in use, including jobs waiting out a retry delay.
    pub active: usize,
    pub max_concurrent: usize,
    /// Jobs that reached `Complete` or a final `Error`.
    pub total_processed: u64,
    pub total_failed: u64,
    pub average_processing_time_ms: f64,
}

/// A job in `items`, with the bookkeeping the queue needs around it.
#[derive(Debug)]
struct Entry {
    job: Job,
    /// Admission order, the last FIFO tiebreaker.
    seq: u64,
    /// Set while a stream processor holds a slot for this job.
    lease: Option<u64>,
}

/// Per-session queue state. Every mutation happens under one lock, so
/// admission and dispatch decisions are atomic with respect to each other.
#[derive(Debug)]
pub(crate) struct QueueState {
    items: HashMap<String, Entry>,
    /// Jobs that reached a final state, kept until the producer removes them.
    finished: HashMap<String, Job>,
    active_count: usize,
    max_concurrent: usize,
    total_processed: u64,
    total_failed: u64,
    average_processing_time_ms: f64,
    running: bool,
    next_seq: u64,
    next_lease: u64,
}

/// Handed from `tick` to a freshly spawned stream processor.
pub(crate) struct Dispatch {
    pub(crate) job_id: String,
    pub(crate) lease: u64,
    pub(crate) cancel: CancellationToken,
}

impl QueueState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            items: HashMap::new(),
            finished: HashMap::new(),
            active_count: 0,
            max_concurrent: max_concurrent.max(1),
            total_processed: 0,
            total_failed: 0,
            average_processing_time_ms: 0.0,
            running: false,
            next_seq: 0,
            next_lease: 0,
        }
    }

    fn bound_mut(&mut self, job_id: &str, lease: u64) -> Option<&mut Entry> {
        self.items
            .get_mut(job_id)
            .filter(|entry| entry.lease == Some(lease))
    }

    fn queued_in_dispatch_order(&self) -> Vec<&Entry> {
        let mut queued: Vec<&Entry> = self
            .items
            .values()
            .filter(|entry| entry.job.status == JobStatus::Queued)
            .collect();
        queued.sort_by(|a, b| dispatch_order(a, b));
        queued
    }

    /// Move a job out of `items` into `finished`, releasing its slot.
    fn retire(&mut self, job_id: &str) -> Option<&Job> {
        let entry = self.items.remove(job_id)?;
        if entry.lease.is_some() {
            self.active_count = self.active_count.saturating_sub(1);
        }
        entry.job.cancel_token.cancel();

        let job = entry.job;
        if matches!(job.status, JobStatus::Complete | JobStatus::Error(_)) {
            self.total_processed += 1;
            if job.error().is_some() {
                self.total_failed += 1;
            }
            if let Some(ms) = job.processing_time_ms() {
                let n = self.total_processed as f64;
                self.average_processing_time_ms += (ms as f64 - self.average_processing_time_ms) / n;
            }
        }

        let id = job.id.clone();
        self.finished.insert(id.clone(), job);
        self.finished.get(&id)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self
                .items
                .values()
                .filter(|entry| entry.job.status == JobStatus::Queued)
                .count(),
            active: self.active_count,
            max_concurrent: self.max_concurrent,
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            average_processing_time_ms: self.average_processing_time_ms,
        }
    }
}

/// Priority descending, then `enqueued_at` ascending, then admission order.
fn dispatch_order(a: &Entry, b: &Entry) -> Ordering {
    b.job
        .priority
        .cmp(&a.job.priority)
        .then_with(|| a.job.enqueued_at.cmp(&b.job.enqueued_at))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// State shared between the manager and its stream processors.
pub(crate) struct Shared<B: CompletionBackend> {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    pub(crate) backend: B,
    pub(crate) config: QueueConfig,
    completion: CompletionConfig,
}

impl<B: CompletionBackend> Shared<B> {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent before anything
        // that could panic, so a poisoned lock is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Fill free slots with queued jobs. Synchronous: the whole decision is
    /// made under the state lock, then a processor is spawned per job.
    fn tick(self: &Arc<Self>) {
        let dispatched = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            let available = state.max_concurrent.saturating_sub(state.active_count);
            if available == 0 {
                return;
            }

            let ids: Vec<String> = state
                .queued_in_dispatch_order()
                .into_iter()
                .take(available)
                .map(|entry| entry.job.id.clone())
                .collect();

            let mut dispatched = Vec::with_capacity(ids.len());
            for id in ids {
                let lease = state.next_lease;
                let Some(entry) = state.items.get_mut(&id) else {
                    continue;
                };
                if let Err(e) = entry.job.transition(JobStatus::Processing) {
                    error!(job_id = %id, error = %e, "Failed to dispatch job");
                    continue;
                }
                entry.lease = Some(lease);
                let cancel = entry.job.cancel_token.clone();
                let attempt = entry.job.retry_count + 1;
                state.next_lease += 1;
                state.active_count += 1;

                info!(job_id = %id, attempt, active = state.active_count, "Dispatching job");
                self.emit(QueueEvent::Started {
                    job_id: id.clone(),
                    attempt,
                });
                dispatched.push(Dispatch {
                    job_id: id,
                    lease,
                    cancel,
                });
            }
            dispatched
        };

        for dispatch in dispatched {
            let processor = StreamProcessor::new(Arc::clone(self), dispatch);
            tokio::spawn(processor.run());
        }
    }

    /// Build the request for the next attempt, with the retries used so far.
    pub(crate) fn request_for(&self, job_id: &str, lease: u64) -> Option<(CompletionRequest, u32)> {
        let mut state = self.state();
        let entry = state.bound_mut(job_id, lease)?;
        let request = CompletionRequest {
            job_id: job_id.to_string(),
            source_text: entry.job.source_text.clone(),
            config: self.completion.clone(),
        };
        Some((request, entry.job.retry_count))
    }

    /// Append a streamed delta. Fails with `Cancelled` once the job is no
    /// longer bound to this processor.
    pub(crate) fn append_delta(
        &self,
        job_id: &str,
        lease: u64,
        delta: String,
        progress: StreamProgress,
    ) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .bound_mut(job_id, lease)
            .ok_or(RewriteError::Cancelled)?;
        let job = &mut entry.job;

        if job.status == JobStatus::Processing {
            job.transition(JobStatus::Streaming)?;
            self.emit(QueueEvent::Streaming {
                job_id: job_id.to_string(),
            });
        }
        if job.status != JobStatus::Streaming {
            return Err(RewriteError::Cancelled);
        }

        job.result_text.push_str(&delta);
        job.progress = Some(progress);
        debug!(job_id, bytes = progress.bytes_received, percentage = progress.percentage, "Applied delta");
        self.emit(QueueEvent::Delta {
            job_id: job_id.to_string(),
            delta,
            progress,
        });
        Ok(())
    }

    pub(crate) fn complete(self: &Arc<Self>, job_id: &str, lease: u64, progress: StreamProgress) {
        {
            let mut state = self.state();
            let Some(entry) = state.bound_mut(job_id, lease) else {
                return;
            };
            let job = &mut entry.job;
            if job.status == JobStatus::Processing {
                if let Err(e) = job.transition(JobStatus::Streaming) {
                    error!(job_id, error = %e, "Failed to complete job");
                    return;
                }
                self.emit(QueueEvent::Streaming {
                    job_id: job_id.to_string(),
                });
            }
            if let Err(e) = job.transition(JobStatus::Complete) {
                error!(job_id, error = %e, "Failed to complete job");
                return;
            }
            job.progress = Some(progress);

            if let Some(job) = state.retire(job_id) {
                info!(job_id, chars = job.result_text.chars().count(), elapsed_ms = ?job.processing_time_ms(), "Job complete");
                self.emit(QueueEvent::Completed {
                    job_id: job_id.to_string(),
                    result_text: job.result_text.clone(),
                    progress,
                });
            }
        }
        self.tick();
    }

    pub(crate) fn fail(self: &Arc<Self>, job_id: &str, lease: u64, job_error: JobError) {
        {
            let mut state = self.state();
            let Some(entry) = state.bound_mut(job_id, lease) else {
                return;
            };
            if let Err(e) = entry.job.transition(JobStatus::Error(job_error.clone())) {
                error!(job_id, error = %e, "Failed to record job failure");
                return;
            }
            state.retire(job_id);
            error!(job_id, kind = %job_error.kind, retries = job_error.retry_count, error = %job_error.message, "Job failed");
            self.emit(QueueEvent::Failed {
                job_id: job_id.to_string(),
                error: job_error,
            });
        }
        self.tick();
    }

    /// Record a transient failure. The job stays in `items` and keeps its
    /// slot while the processor waits out `delay`.
    pub(crate) fn schedule_retry(
        &self,
        job_id: &str,
        lease: u64,
        job_error: JobError,
        delay: Duration,
    ) -> bool {
        let mut state = self.state();
        let Some(entry) = state.bound_mut(job_id, lease) else {
            return false;
        };
        if let Err(e) = entry.job.transition(JobStatus::Error(job_error.clone())) {
            error!(job_id, error = %e, "Failed to schedule retry");
            return false;
        }
        self.emit(QueueEvent::RetryScheduled {
            job_id: job_id.to_string(),
            error: job_error,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        true
    }

    /// Re-enter `Processing` in the same slot after a retry delay.
    pub(crate) fn resume_after_backoff(&self, job_id: &str, lease: u64) -> bool {
        let mut state = self.state();
        let Some(entry) = state.bound_mut(job_id, lease) else {
            return false;
        };
        let job = &mut entry.job;
        if let Err(e) = job.transition(JobStatus::Processing) {
            error!(job_id, error = %e, "Failed to resume job after backoff");
            return false;
        }
        job.retry_count += 1;
        job.result_text.clear();
        job.progress = None;
        self.emit(QueueEvent::Started {
            job_id: job_id.to_string(),
            attempt: job.retry_count + 1,
        });
        true
    }

    /// Cancel every job holding a slot. Queued jobs are left alone.
    fn cancel_active(&self, state: &mut QueueState) -> usize {
        let active: Vec<String> = state
            .items
            .values()
            .filter(|entry| entry.lease.is_some())
            .map(|entry| entry.job.id.clone())
            .collect();

        for id in &active {
            self.cancel_bound(state, id);
        }
        active.len()
    }

    fn cancel_bound(&self, state: &mut QueueState, job_id: &str) {
        let Some(entry) = state.items.get_mut(job_id) else {
            return;
        };
        entry.job.cancel_token.cancel();
        if let Err(e) = entry.job.transition(JobStatus::Cancelled) {
            error!(job_id, error = %e, "Failed to cancel job");
            return;
        }
        state.retire(job_id);
        info!(job_id, "Job cancelled");
        self.emit(QueueEvent::Cancelled {
            job_id: job_id.to_string(),
        });
    }
}

/// Owns the rewrite queue for one editor session.
///
/// Jobs are admitted with [`enqueue()`](Self::enqueue), dispatched by
/// priority into at most `max_concurrent` slots while the manager is
/// [started](Self::start), streamed through the configured
/// [`CompletionBackend`], and retained in their final state until removed.
///
/// Must be used from within a tokio runtime: dispatch spawns one task per
/// active job.
///
/// # Example
///
/// ```no_run
/// use rewrite_queue::{CompletionConfig, Priority, QueueConfig, QueueManager};
///
/// # async fn run() {
/// let manager = QueueManager::new(
///     QueueConfig::default(),
///     CompletionConfig::from_env().with_model("openai/gpt-4o-mini"),
/// );
/// let mut events = manager.subscribe();
/// manager.start();
/// manager.submit("para-1", "Some text to rewrite.", Priority::Normal);
///
/// while let Ok(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # }
/// ```
pub struct QueueManager<B: CompletionBackend = HttpBackend> {
    shared: Arc<Shared<B>>,
}

impl QueueManager<HttpBackend> {
    /// Manager backed by the HTTP completion client.
    pub fn new(config: QueueConfig, completion: CompletionConfig) -> Self {
        Self::with_backend(config, completion, HttpBackend::new())
    }
}

impl<B: CompletionBackend> QueueManager<B> {
    /// Manager backed by a custom [`CompletionBackend`]. Dispatch does not
    /// begin until [`start()`](Self::start).
    pub fn with_backend(config: QueueConfig, completion: CompletionConfig, backend: B) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Shared {
            state: Mutex::new(QueueState::new(config.max_concurrent)),
            events,
            backend,
            config,
            completion,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Begin dispatching queued jobs.
    pub fn start(&self) {
        self.shared.state().running = true;
        info!("Rewrite queue started");
        self.shared.tick();
    }

    /// Stop dispatching and cancel active jobs. Queued jobs stay queued and
    /// are picked up by the next [`start()`](Self::start).
    pub fn stop(&self) {
        let mut state = self.shared.state();
        if !state.running && state.active_count == 0 {
            return;
        }
        state.running = false;
        let cancelled = self.shared.cancel_active(&mut state);
        info!(cancelled, "Rewrite queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Admit `job` at `priority`.
    ///
    /// Returns `false` (and logs a warning) if a job with the same id is
    /// already queued or active, or if `job` is not `Pending`. A job id that
    /// only exists in the finished set is admitted again as a fresh job.
    pub fn enqueue(&self, mut job: Job, priority: Priority) -> bool {
        {
            let mut state = self.shared.state();
            if state.items.contains_key(&job.id) {
                warn!(job_id = %job.id, "Job already queued or active, ignoring enqueue");
                return false;
            }
            if job.status != JobStatus::Pending {
                warn!(job_id = %job.id, status = %job.status, "Only pending jobs can be enqueued");
                return false;
            }

            job.priority = priority;
            job.cancel_token = CancellationToken::new();
            if let Err(e) = job.transition(JobStatus::Queued) {
                warn!(job_id = %job.id, error = %e, "Failed to enqueue job");
                return false;
            }

            state.finished.remove(&job.id);
            let seq = state.next_seq;
            state.next_seq += 1;
            let job_id = job.id.clone();
            debug!(job_id = %job_id, ?priority, "Job queued");
            state.items.insert(
                job_id.clone(),
                Entry {
                    job,
                    seq,
                    lease: None,
                },
            );
            self.shared.emit(QueueEvent::Queued { job_id });
        }
        self.shared.tick();
        true
    }

    /// Producer-facing form of [`enqueue()`](Self::enqueue).
    pub fn submit(&self, unit_id: impl Into<String>, text: impl Into<String>, priority: Priority) -> bool {
        self.enqueue(Job::new(text).with_id(unit_id), priority)
    }

    /// Withdraw a job.
    ///
    /// A queued job is removed and returned in `Pending`. An active job
    /// (including one waiting out a retry delay) is cancelled: its
    /// processor stops writing, its slot is freed, and the returned job is
    /// `Cancelled`.
    pub fn dequeue(&self, job_id: &str) -> Result<Job> {
        let job = {
            let mut state = self.shared.state();
            let entry = state
                .items
                .get(job_id)
                .ok_or_else(|| RewriteError::NotFound(job_id.to_string()))?;

            if entry.lease.is_none() {
                let mut entry = state
                    .items
                    .remove(job_id)
                    .ok_or_else(|| RewriteError::NotFound(job_id.to_string()))?;
                entry.job.cancel_token.cancel();
                entry.job.transition(JobStatus::Pending)?;
                debug!(job_id, "Job dequeued");
                self.shared.emit(QueueEvent::Dequeued {
                    job_id: job_id.to_string(),
                });
                return Ok(entry.job);
            }

            self.shared.cancel_bound(&mut state, job_id);
            state
                .finished
                .get(job_id)
                .cloned()
                .ok_or_else(|| RewriteError::NotFound(job_id.to_string()))?
        };
        self.shared.tick();
        Ok(job)
    }

    /// Cancel every active job and discard every queued one. Returns the
    /// number of jobs affected.
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state();
        let cancelled = self.shared.cancel_active(&mut state);

        let discarded: Vec<String> = state.items.keys().cloned().collect();
        for (job_id, entry) in state.items.drain() {
            entry.job.cancel_token.cancel();
            self.shared.emit(QueueEvent::Dequeued { job_id });
        }
        state.active_count = 0;
        info!(cancelled, discarded = discarded.len(), "Queue cleared");
        cancelled + discarded.len()
    }

    /// Manually retry a job that ended in `Error`, under the same id.
    ///
    /// The automatic retry count is reset only when `reset_retry_count` is
    /// set; otherwise the job resumes with the retries it already used.
    pub fn retry(&self, job_id: &str, reset_retry_count: bool) -> Result<bool> {
        let (fresh, priority) = {
            let state = self.shared.state();
            let job = state
                .finished
                .get(job_id)
                .ok_or_else(|| RewriteError::NotFound(job_id.to_string()))?;
            if job.error().is_none() {
                return Err(RewriteError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status.as_str(),
                    to: JobStatus::Queued.as_str(),
                });
            }
            (job.fresh_copy(!reset_retry_count), job.priority)
        };
        Ok(self.enqueue(fresh, priority))
    }

    /// Snapshot of a job, whether queued, active or finished.
    pub fn job(&self, job_id: &str) -> Option<Job> {
        let state = self.shared.state();
        state
            .items
            .get(job_id)
            .map(|entry| entry.job.clone())
            .or_else(|| state.finished.get(job_id).cloned())
    }

    /// Active jobs followed by queued jobs in dispatch order.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.shared.state();
        let mut active: Vec<&Entry> = state
            .items
            .values()
            .filter(|entry| entry.lease.is_some())
            .collect();
        active.sort_by(|a, b| dispatch_order(a, b));
        active
            .into_iter()
            .chain(state.queued_in_dispatch_order())
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// Drop a finished job's record.
    pub fn remove_finished(&self, job_id: &str) -> Option<Job> {
        self.shared.state().finished.remove(job_id)
    }

    /// Drop every finished record. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.shared.state();
        let count = state.finished.len();
        state.finished.clear();
        count
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.state().stats()
    }

    pub fn active_count(&self) -> usize {
        self.shared.state().active_count
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.state().max_concurrent
    }

    /// Subscribe to job state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }
}

impl<B: CompletionBackend> Drop for QueueManager<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<B: CompletionBackend> std::fmt::Debug for QueueManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("QueueManager")
            .field("running", &self.is_running())
            .field("stats", &stats)
            .finish()
    }
}

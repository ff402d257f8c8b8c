//! Job tracking manager.
//!
//! Maps UI file indices to backend job ids and aggregates progress, queue
//! metadata and results. All maps live in one immutable [`TrackerSnapshot`]
//! that is replaced wholesale on every change, so a reader holding a snapshot
//! never sees a half-applied update.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::poller::{JobPoller, ProgressUpdate};
use super::{JobRecord, JobSubmission, JobSubmitter, QueueStatus, ToolType, UploadFile};
use crate::error::ApiError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot & events
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of every tracked job.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot<R> {
    /// file index -> job id (a `pending-` placeholder until the server answers)
    pub file_jobs: im::HashMap<usize, String>,
    pub jobs: im::HashMap<String, JobRecord>,
    /// file index -> percent complete
    pub progress: im::HashMap<usize, u8>,
    pub queue_status: im::HashMap<String, QueueStatus>,
    pub results: im::HashMap<usize, R>,
    pub errors: im::HashMap<usize, ApiError>,
}

impl<R: Clone> Default for TrackerSnapshot<R> {
    fn default() -> Self {
        Self {
            file_jobs: im::HashMap::new(),
            jobs: im::HashMap::new(),
            progress: im::HashMap::new(),
            queue_status: im::HashMap::new(),
            results: im::HashMap::new(),
            errors: im::HashMap::new(),
        }
    }
}

impl<R: Clone> TrackerSnapshot<R> {
    /// Number of jobs still in flight.
    pub fn active_jobs(&self) -> usize {
        self.file_jobs.len()
    }

    fn is_current(&self, file_index: usize, job_id: &str) -> bool {
        self.file_jobs.get(&file_index).map(String::as_str) == Some(job_id)
    }

    fn remove_job(&mut self, file_index: usize, job_id: &str) {
        self.file_jobs.remove(&file_index);
        self.jobs.remove(job_id);
        self.progress.remove(&file_index);
        self.queue_status.remove(job_id);
    }
}

/// Change notification broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Submitted {
        file_index: usize,
        job_id: String,
    },
    /// The placeholder id was replaced by the server-assigned one.
    JobAssigned {
        file_index: usize,
        job_id: String,
    },
    Progress {
        file_index: usize,
        job_id: String,
        progress: u8,
        queue: QueueStatus,
    },
    Completed {
        file_index: usize,
        job_id: String,
    },
    Failed {
        file_index: usize,
        job_id: String,
        error: ApiError,
    },
    Cancelled {
        file_index: usize,
        job_id: String,
    },
    Cleared,
}

impl TrackerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackerEvent::Completed { .. } | TrackerEvent::Failed { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobTracker
// ─────────────────────────────────────────────────────────────────────────────

struct Shared<R> {
    snapshot: Arc<TrackerSnapshot<R>>,
    /// Poll cancellation, keyed by file index.
    tokens: HashMap<usize, CancellationToken>,
}

struct Inner<R> {
    submitter: Arc<dyn JobSubmitter>,
    poller: Arc<JobPoller>,
    shared: RwLock<Shared<R>>,
    events: broadcast::Sender<TrackerEvent>,
}

/// Tracks submitted jobs per file index. `R` is the UI-facing result type
/// produced by the processor passed to [`submit`](Self::submit).
pub struct JobTracker<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for JobTracker<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Clone + Send + Sync + 'static> JobTracker<R> {
    pub fn new(submitter: Arc<dyn JobSubmitter>, poller: Arc<JobPoller>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                submitter,
                poller,
                shared: RwLock::new(Shared {
                    snapshot: Arc::new(TrackerSnapshot::default()),
                    tokens: HashMap::new(),
                }),
                events,
            }),
        }
    }

    /// Current consistent view of all maps.
    pub fn snapshot(&self) -> Arc<TrackerSnapshot<R>> {
        Arc::clone(&self.inner.shared.read().snapshot)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    pub fn job_for(&self, file_index: usize) -> Option<String> {
        self.snapshot().file_jobs.get(&file_index).cloned()
    }

    pub fn result(&self, file_index: usize) -> Option<R> {
        self.snapshot().results.get(&file_index).cloned()
    }

    /// Submits `file` and tracks it under `file_index`.
    ///
    /// A job already tracked for the same index is cancelled and replaced.
    /// Queued jobs are polled in the background and `processor` maps their
    /// result once they complete; a direct result is processed before this
    /// returns. Returns the tracked job id.
    ///
    /// # Errors
    ///
    /// Returns the submission error (also recorded for the file index), the
    /// processor's error for a direct result, or `ApiError::Cancelled` if the
    /// file was cancelled while the upload was in flight.
    pub async fn submit<P>(
        &self,
        file_index: usize,
        tool: ToolType,
        file: UploadFile,
        processor: P,
    ) -> Result<String, ApiError>
    where
        P: FnOnce(Value) -> Result<R, ApiError> + Send + 'static,
    {
        let placeholder = format!("pending-{}", Uuid::new_v4());
        let cancel = CancellationToken::new();
        self.register(file_index, &placeholder, tool, cancel.clone());

        let submitted = self.inner.submitter.submit_job(tool, &file).await;
        if cancel.is_cancelled() {
            debug!("[TRACKER] File {} cancelled during upload", file_index);
            return Err(ApiError::Cancelled);
        }

        match submitted {
            Err(err) => {
                warn!("[TRACKER] File {} submission failed: {}", file_index, err);
                self.finish(file_index, &placeholder, Err(err.clone()));
                Err(err)
            }
            Ok(JobSubmission::Direct(value)) => {
                let outcome = processor(value);
                let returned = match &outcome {
                    Ok(_) => Ok(placeholder.clone()),
                    Err(err) => Err(err.clone()),
                };
                self.finish(file_index, &placeholder, outcome);
                returned
            }
            Ok(JobSubmission::Queued { job_id, .. }) => {
                if !self.assign(file_index, &placeholder, &job_id, tool) {
                    return Err(ApiError::Cancelled);
                }
                self.spawn_poll(file_index, job_id.clone(), tool, cancel, processor);
                Ok(job_id)
            }
        }
    }

    /// Stops tracking `file_index`. A late poll result is discarded.
    /// Returns false if nothing was tracked.
    pub fn cancel(&self, file_index: usize) -> bool {
        let job_id = {
            let mut shared = self.inner.shared.write();
            let Some(job_id) = shared.snapshot.file_jobs.get(&file_index).cloned() else {
                return false;
            };
            let mut next = (*shared.snapshot).clone();
            next.remove_job(file_index, &job_id);
            shared.snapshot = Arc::new(next);
            if let Some(token) = shared.tokens.remove(&file_index) {
                token.cancel();
            }
            job_id
        };

        info!("[TRACKER] Cancelled job {} for file {}", job_id, file_index);
        self.emit(TrackerEvent::Cancelled { file_index, job_id });
        true
    }

    /// Cancels every poll and resets every map, results included.
    pub fn clear_all(&self) {
        let cancelled = {
            let mut shared = self.inner.shared.write();
            let tokens = std::mem::take(&mut shared.tokens);
            for token in tokens.values() {
                token.cancel();
            }
            shared.snapshot = Arc::new(TrackerSnapshot::default());
            tokens.len()
        };

        info!("[TRACKER] Cleared all tracking ({} active jobs cancelled)", cancelled);
        self.emit(TrackerEvent::Cleared);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn emit(&self, event: TrackerEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    fn register(&self, file_index: usize, placeholder: &str, tool: ToolType, token: CancellationToken) {
        {
            let mut shared = self.inner.shared.write();
            let mut next = (*shared.snapshot).clone();

            if let Some(previous) = next.file_jobs.get(&file_index).cloned() {
                debug!("[TRACKER] Replacing job {} for file {}", previous, file_index);
                next.remove_job(file_index, &previous);
            }
            if let Some(old) = shared.tokens.insert(file_index, token) {
                old.cancel();
            }

            next.results.remove(&file_index);
            next.errors.remove(&file_index);
            next.file_jobs.insert(file_index, placeholder.to_string());
            next.jobs.insert(
                placeholder.to_string(),
                JobRecord::new(placeholder, file_index, tool),
            );
            next.progress.insert(file_index, 0);
            shared.snapshot = Arc::new(next);
        }

        self.emit(TrackerEvent::Submitted {
            file_index,
            job_id: placeholder.to_string(),
        });
    }

    /// Swaps the placeholder for the server job id. False if the file was
    /// cancelled or resubmitted meanwhile.
    fn assign(&self, file_index: usize, placeholder: &str, job_id: &str, tool: ToolType) -> bool {
        {
            let mut shared = self.inner.shared.write();
            if !shared.snapshot.is_current(file_index, placeholder) {
                return false;
            }
            let mut next = (*shared.snapshot).clone();
            let mut record = next
                .jobs
                .remove(placeholder)
                .unwrap_or_else(|| JobRecord::new(job_id, file_index, tool));
            record.job_id = job_id.to_string();
            next.jobs.insert(job_id.to_string(), record);
            next.file_jobs.insert(file_index, job_id.to_string());
            if let Some(queue) = next.queue_status.remove(placeholder) {
                next.queue_status.insert(job_id.to_string(), queue);
            }
            shared.snapshot = Arc::new(next);
        }

        debug!("[TRACKER] File {} assigned job {}", file_index, job_id);
        self.emit(TrackerEvent::JobAssigned {
            file_index,
            job_id: job_id.to_string(),
        });
        true
    }

    fn apply_progress(&self, file_index: usize, update: &ProgressUpdate) {
        {
            let mut shared = self.inner.shared.write();
            if !shared.snapshot.is_current(file_index, &update.job_id) {
                return;
            }
            let mut next = (*shared.snapshot).clone();
            next.progress.insert(file_index, update.progress);
            next.queue_status
                .insert(update.job_id.clone(), update.queue.clone());
            if let Some(record) = next.jobs.get_mut(&update.job_id) {
                record.attempts = update.attempt;
                record.backoff_factor = update.backoff_factor;
            }
            shared.snapshot = Arc::new(next);
        }

        self.emit(TrackerEvent::Progress {
            file_index,
            job_id: update.job_id.clone(),
            progress: update.progress,
            queue: update.queue.clone(),
        });
    }

    /// Removes the job from every map and records its outcome.
    ///
    /// Idempotent: returns false, changing nothing, when `job_id` is no
    /// longer the job tracked for `file_index`.
    fn finish(&self, file_index: usize, job_id: &str, outcome: Result<R, ApiError>) -> bool {
        let failure = {
            let mut shared = self.inner.shared.write();
            if !shared.snapshot.is_current(file_index, job_id) {
                debug!("[TRACKER] Ignoring stale outcome for job {}", job_id);
                return false;
            }
            let mut next = (*shared.snapshot).clone();
            next.remove_job(file_index, job_id);
            let failure = match outcome {
                Ok(result) => {
                    next.results.insert(file_index, result);
                    None
                }
                Err(err) => {
                    next.errors.insert(file_index, err.clone());
                    Some(err)
                }
            };
            shared.snapshot = Arc::new(next);
            shared.tokens.remove(&file_index);
            failure
        };

        let job_id = job_id.to_string();
        match failure {
            None => {
                info!("[TRACKER] File {} completed (job {})", file_index, job_id);
                self.emit(TrackerEvent::Completed { file_index, job_id });
            }
            Some(error) => {
                warn!("[TRACKER] File {} failed (job {}): {}", file_index, job_id, error);
                self.emit(TrackerEvent::Failed {
                    file_index,
                    job_id,
                    error,
                });
            }
        }
        true
    }

    fn spawn_poll<P>(
        &self,
        file_index: usize,
        job_id: String,
        tool: ToolType,
        cancel: CancellationToken,
        processor: P,
    ) where
        P: FnOnce(Value) -> Result<R, ApiError> + Send + 'static,
    {
        let tracker = self.clone();
        let poller = Arc::clone(&self.inner.poller);

        tokio::spawn(async move {
            let outcome = poller
                .poll(&job_id, tool, &cancel, |update| {
                    tracker.apply_progress(file_index, update)
                })
                .await;

            match outcome {
                Err(ApiError::Cancelled) => {
                    debug!("[TRACKER] Poll for job {} stopped", job_id);
                }
                Ok(value) => {
                    tracker.finish(file_index, &job_id, processor(value));
                }
                Err(err) => {
                    tracker.finish(file_index, &job_id, Err(err));
                }
            }
        });
    }
}

//! Adaptive job status polling.
//!
//! Each poll loop reads the status cache first, then the [`JobStatusSource`].
//! Fetch errors only slow the loop down; the caller sees exactly one terminal
//! outcome: the job result, a job failure, a local timeout or cancellation.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::StatusCache;
use super::{JobState, JobStatusSnapshot, JobStatusSource, QueueStatus, ToolType};
use crate::config::PollerConfig;
use crate::error::ApiError;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// A fresh non-terminal status reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub state: JobState,
    pub progress: u8,
    pub queue: QueueStatus,
    /// Attempts used so far, this one included.
    pub attempt: u32,
    pub backoff_factor: f64,
}

/// Event emitted by a spawned poll loop. Exactly one non-`Progress` event
/// ends every stream.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Progress(ProgressUpdate),
    Completed(Value),
    Failed(ApiError),
    Cancelled,
}

impl PollEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollEvent::Progress(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobPoller
// ─────────────────────────────────────────────────────────────────────────────

/// Polls job status with backoff and a shared read cache.
pub struct JobPoller {
    source: Arc<dyn JobStatusSource>,
    cache: Arc<StatusCache>,
    config: PollerConfig,
}

impl JobPoller {
    pub fn new(source: Arc<dyn JobStatusSource>, config: PollerConfig) -> Self {
        let cache = Arc::new(StatusCache::new(config.cache_ttl()));
        Self {
            source,
            cache,
            config,
        }
    }

    /// Shares an existing cache between pollers.
    pub fn with_cache(mut self, cache: Arc<StatusCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Next backoff factor after a failed fetch.
    fn next_backoff(&self, factor: f64) -> f64 {
        (factor * self.config.backoff_multiplier).min(self.config.max_backoff_factor)
    }

    /// Polls `job_id` until it reaches a terminal state.
    ///
    /// `on_progress` runs for every fresh non-terminal fetch, even when the
    /// progress value did not change. Cache hits are not fetches and emit
    /// nothing, but still count against `max_attempts`.
    ///
    /// # Errors
    ///
    /// - `ApiError::JobFailed` - the server reported the job as failed
    /// - `ApiError::PollTimeout` - `max_attempts` used without a terminal state
    /// - `ApiError::Cancelled` - `cancel` fired; a late response is discarded
    pub async fn poll<F>(
        &self,
        job_id: &str,
        tool: ToolType,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<Value, ApiError>
    where
        F: FnMut(&ProgressUpdate) + Send,
    {
        let outcome = self.run(job_id, tool, cancel, on_progress).await;
        if matches!(outcome, Err(ApiError::Cancelled)) {
            self.cache.invalidate(job_id);
        }
        outcome
    }

    async fn run<F>(
        &self,
        job_id: &str,
        tool: ToolType,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Value, ApiError>
    where
        F: FnMut(&ProgressUpdate) + Send,
    {
        let mut attempts = 0u32;
        let mut backoff_factor = 1.0f64;

        loop {
            if cancel.is_cancelled() {
                debug!("[POLL] {} cancelled", job_id);
                return Err(ApiError::Cancelled);
            }

            if attempts >= self.config.max_attempts {
                warn!("[POLL] {} timed out after {} attempts", job_id, attempts);
                self.cache.invalidate(job_id);
                return Err(ApiError::PollTimeout {
                    job_id: job_id.to_string(),
                    attempts,
                });
            }
            attempts += 1;

            if self.cache.get(job_id).is_some() {
                debug!("[POLL] {} attempt {} served from cache", job_id, attempts);
            } else {
                let fetched = self.source.fetch_status(job_id, tool).await;

                // The request is never aborted mid-flight; its answer is
                // dropped instead.
                if cancel.is_cancelled() {
                    debug!("[POLL] {} cancelled, discarding response", job_id);
                    return Err(ApiError::Cancelled);
                }

                match fetched {
                    Ok(snap) => {
                        backoff_factor = 1.0;
                        if let Some(outcome) = self.settle(job_id, &snap) {
                            return outcome;
                        }
                        self.cache.insert(&snap);
                        on_progress(&ProgressUpdate {
                            job_id: job_id.to_string(),
                            state: snap.state,
                            progress: snap.progress,
                            queue: snap.queue_status(),
                            attempt: attempts,
                            backoff_factor,
                        });
                    }
                    Err(err) => {
                        backoff_factor = self.next_backoff(backoff_factor);
                        debug!(
                            "[POLL] {} fetch failed ({}), backoff x{:.2}",
                            job_id, err, backoff_factor
                        );
                    }
                }
            }

            let interval = self.config.interval_for(backoff_factor);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[POLL] {} cancelled while waiting", job_id);
                    return Err(ApiError::Cancelled);
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Terminal outcome for `snap`, or `None` if the job is still running.
    fn settle(&self, job_id: &str, snap: &JobStatusSnapshot) -> Option<Result<Value, ApiError>> {
        match snap.state {
            JobState::Completed => {
                self.cache.invalidate(job_id);
                info!("[POLL] {} completed", job_id);
                Some(Ok(snap.result.clone().unwrap_or(Value::Null)))
            }
            JobState::Failed => {
                self.cache.invalidate(job_id);
                let message = snap
                    .error
                    .clone()
                    .unwrap_or_else(|| "Job failed".to_string());
                warn!("[POLL] {} failed: {}", job_id, message);
                Some(Err(ApiError::JobFailed {
                    job_id: job_id.to_string(),
                    message,
                }))
            }
            _ => None,
        }
    }

    /// Runs [`poll`](Self::poll) on a task and streams its events.
    pub fn spawn(
        self: &Arc<Self>,
        job_id: impl Into<String>,
        tool: ToolType,
        cancel: CancellationToken,
    ) -> PollHandle {
        let job_id = job_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let poller = Arc::clone(self);
        let task_job_id = job_id.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let progress_tx = tx.clone();
            let outcome = poller
                .poll(&task_job_id, tool, &task_cancel, move |update| {
                    let _ = progress_tx.send(PollEvent::Progress(update.clone()));
                })
                .await;

            let event = match outcome {
                Ok(result) => PollEvent::Completed(result),
                Err(ApiError::Cancelled) => PollEvent::Cancelled,
                Err(err) => PollEvent::Failed(err),
            };
            let _ = tx.send(event);
        });

        PollHandle {
            job_id,
            events: rx,
            cancel,
            task,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PollHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a spawned poll loop. Dropping it cancels the loop.
pub struct PollHandle {
    job_id: String,
    events: mpsc::UnboundedReceiver<PollEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event; `None` after the terminal event has been received.
    pub async fn next_event(&mut self) -> Option<PollEvent> {
        self.events.recv().await
    }

    /// Waits for the terminal event, dropping progress.
    pub async fn finish(mut self) -> PollEvent {
        while let Some(event) = self.events.recv().await {
            if event.is_terminal() {
                return event;
            }
        }
        PollEvent::Cancelled
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

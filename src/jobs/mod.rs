//! Background image-processing jobs: domain types and collaborator traits.

pub mod cache;
pub mod poller;
pub mod tracker;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ApiError;

pub use cache::StatusCache;
pub use poller::{JobPoller, PollEvent, PollHandle, ProgressUpdate};
pub use tracker::{JobTracker, TrackerEvent, TrackerSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// Image tool a job runs on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Compress,
    Convert,
    Resize,
    Crop,
}

impl ToolType {
    /// Wire name, used in the submission path and the status `type` query.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Compress => "compress",
            ToolType::Convert => "convert",
            ToolType::Resize => "resize",
            ToolType::Crop => "crop",
        }
    }
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued, not yet picked up by a worker.
    Waiting,
    /// Queued with a scheduled start.
    Delayed,
    /// A worker is processing the job.
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Parses a wire state. Unknown states map to `Waiting` so the job keeps
    /// being polled.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "delayed" => JobState::Delayed,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            _ => JobState::Waiting,
        }
    }

    /// Returns true once the job cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// One status reading for a job.
#[derive(Debug, Clone)]
pub struct JobStatusSnapshot {
    pub job_id: String,
    pub state: JobState,
    /// Percent complete, clamped to 0..=100.
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub queue_position: Option<u32>,
    pub estimated_wait: Option<String>,
    pub fetched_at: Instant,
}

impl JobStatusSnapshot {
    /// Snapshot stamped with the current time.
    pub fn new(job_id: impl Into<String>, state: JobState, progress: u8) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            progress: progress.min(100),
            result: None,
            error: None,
            queue_position: None,
            estimated_wait: None,
            fetched_at: Instant::now(),
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            position: self.queue_position,
            wait_time: self.estimated_wait.clone(),
            is_processing: self.state == JobState::Active,
        }
    }
}

/// Queue metadata shown next to a job; recomputed on every progress update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub position: Option<u32>,
    pub wait_time: Option<String>,
    pub is_processing: bool,
}

/// Book-keeping for one tracked unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub file_index: usize,
    pub tool: ToolType,
    pub attempts: u32,
    pub backoff_factor: f64,
    pub submitted_at: Instant,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, file_index: usize, tool: ToolType) -> Self {
        Self {
            job_id: job_id.into(),
            file_index,
            tool,
            attempts: 0,
            backoff_factor: 1.0,
            submitted_at: Instant::now(),
        }
    }
}

/// File payload handed to the submission endpoint.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
    /// Extra form fields (quality, width, format...).
    pub options: Vec<(String, String)>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime: None,
            bytes,
            options: Vec::new(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }
}

/// What the submission endpoint answered.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSubmission {
    /// Job accepted into the background queue.
    Queued { job_id: String, status_url: String },
    /// Server processed the file synchronously.
    Direct(Value),
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits for Testing
// ─────────────────────────────────────────────────────────────────────────────

/// Reads job status; implemented by [`ApiClient`](crate::api::ApiClient).
pub trait JobStatusSource: Send + Sync {
    fn fetch_status<'a>(
        &'a self,
        job_id: &'a str,
        tool: ToolType,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatusSnapshot, ApiError>> + Send + 'a>>;
}

/// Submits files for processing; implemented by [`ApiClient`](crate::api::ApiClient).
pub trait JobSubmitter: Send + Sync {
    fn submit_job<'a>(
        &'a self,
        tool: ToolType,
        file: &'a UploadFile,
    ) -> Pin<Box<dyn Future<Output = Result<JobSubmission, ApiError>> + Send + 'a>>;
}

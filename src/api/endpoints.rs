//! Typed image-tools endpoints on top of [`ApiClient::execute`].
//!
//! The image tools are anonymous, so none of these calls send credentials.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use super::client::{ApiClient, FormPart, RequestDescriptor};
use crate::error::ApiError;
use crate::jobs::{
    JobState, JobStatusSnapshot, JobStatusSource, JobSubmission, JobSubmitter, ToolType,
    UploadFile,
};
use crate::reachability::{HealthReport, HealthSource};

/// Multipart field carrying the uploaded file.
const IMAGE_FIELD: &str = "image";

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// `{status, data}` wrapper used by most endpoints.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Health body, bare or wrapped.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HealthBody {
    Wrapped { data: HealthReport },
    Bare(HealthReport),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusData {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    progress: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    queue_position: Option<u32>,
    #[serde(default)]
    estimated_wait_time: Option<Value>,
}

/// One file to include in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    /// Server-side name of the processed file.
    pub filename: String,
    /// Name to use inside the archive.
    pub original_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveData {
    download_url: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoints
// ─────────────────────────────────────────────────────────────────────────────

impl ApiClient {
    /// `GET {health_path}`. Never blocked by the circuit breaker.
    pub async fn check_health(&self) -> Result<HealthReport, ApiError> {
        let req = RequestDescriptor::get(self.context().config.health_path.clone())
            .without_auth()
            .suppress_auth_redirect();
        let body: HealthBody = self.execute_json(&req).await?;
        Ok(match body {
            HealthBody::Wrapped { data } => data,
            HealthBody::Bare(report) => report,
        })
    }

    /// `GET /images/status/{job_id}?type={tool}`.
    pub async fn job_status(
        &self,
        job_id: &str,
        tool: ToolType,
    ) -> Result<JobStatusSnapshot, ApiError> {
        let encoded: String = form_urlencoded::byte_serialize(job_id.as_bytes()).collect();
        let req = RequestDescriptor::get(format!("/images/status/{}?type={}", encoded, tool))
            .without_auth();
        let envelope: Envelope<StatusData> = self.execute_json(&req).await?;
        Ok(snapshot_from_wire(job_id, envelope.data))
    }

    /// `POST /images/{tool}` with the file as multipart field `image`.
    pub async fn submit_job(
        &self,
        tool: ToolType,
        file: &UploadFile,
    ) -> Result<JobSubmission, ApiError> {
        let mut parts = vec![FormPart::File {
            name: IMAGE_FIELD.to_string(),
            file_name: file.file_name.clone(),
            mime: file.mime.clone(),
            bytes: file.bytes.clone(),
        }];
        parts.extend(file.options.iter().map(|(name, value)| FormPart::Text {
            name: name.clone(),
            value: value.clone(),
        }));

        let req = RequestDescriptor::post(format!("/images/{}", tool))
            .with_form(parts)
            .without_auth();
        let body = self.execute(&req).await?;
        Ok(submission_from_wire(tool, body))
    }

    /// `POST /images/archive`; returns the download URL.
    pub async fn create_archive(&self, files: &[ArchiveEntry]) -> Result<String, ApiError> {
        let req = RequestDescriptor::post("/images/archive")
            .with_json(serde_json::json!({ "files": files }))
            .without_auth();
        let envelope: Envelope<ArchiveData> = self.execute_json(&req).await?;
        Ok(envelope.data.download_url)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire mapping
// ─────────────────────────────────────────────────────────────────────────────

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn snapshot_from_wire(job_id: &str, data: StatusData) -> JobStatusSnapshot {
    let state = data
        .state
        .as_deref()
        .map(JobState::parse)
        .unwrap_or(JobState::Waiting);
    let progress = data
        .progress
        .as_f64()
        .map(|p| p.clamp(0.0, 100.0).round() as u8)
        .unwrap_or(0);

    let mut snap = JobStatusSnapshot::new(job_id, state, progress);
    snap.result = data.result.filter(|v| !v.is_null());
    snap.error = data.error.as_ref().and_then(|e| {
        value_to_string(e).or_else(|| e.get("message").and_then(value_to_string))
    });
    snap.queue_position = data.queue_position;
    snap.estimated_wait = data.estimated_wait_time.as_ref().and_then(value_to_string);
    snap
}

fn submission_from_wire(tool: ToolType, body: Value) -> JobSubmission {
    let data = if body.get("data").is_some_and(Value::is_object) {
        body["data"].clone()
    } else {
        body
    };

    match data.get("jobId").and_then(value_to_string) {
        Some(job_id) => {
            let status_url = data
                .get("statusUrl")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("/images/status/{}?type={}", job_id, tool));
            JobSubmission::Queued { job_id, status_url }
        }
        None => JobSubmission::Direct(data),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait impls
// ─────────────────────────────────────────────────────────────────────────────

impl HealthSource for ApiClient {
    fn check_health(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HealthReport, ApiError>> + Send + '_>> {
        Box::pin(ApiClient::check_health(self))
    }
}

impl JobStatusSource for ApiClient {
    fn fetch_status<'a>(
        &'a self,
        job_id: &'a str,
        tool: ToolType,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatusSnapshot, ApiError>> + Send + 'a>> {
        Box::pin(self.job_status(job_id, tool))
    }
}

impl JobSubmitter for ApiClient {
    fn submit_job<'a>(
        &'a self,
        tool: ToolType,
        file: &'a UploadFile,
    ) -> Pin<Box<dyn Future<Output = Result<JobSubmission, ApiError>> + Send + 'a>> {
        Box::pin(ApiClient::submit_job(self, tool, file))
    }
}

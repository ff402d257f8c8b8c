use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for UI display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "authorization:",
    "access_token",
    "refresh_token",
    "set-cookie",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for UI display.
/// If sensitive content is detected, returns the fallback instead.
pub(crate) fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Rate-limit metadata extracted from a 429 response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// `RateLimit-Limit`: requests allowed in the current window.
    pub limit: Option<u64>,
    /// `RateLimit-Remaining`: requests left in the current window.
    pub remaining: Option<u64>,
    /// `RateLimit-Reset-After`: seconds until the window resets.
    pub reset_after_secs: Option<u64>,
    /// `Retry-After`: seconds the server asks us to wait.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitInfo {
    /// Best guess at how long the caller should wait, in seconds.
    pub fn wait_secs(&self) -> Option<u64> {
        self.retry_after_secs.or(self.reset_after_secs)
    }
}

/// User-friendly error presentation for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Crate-wide error type.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    // ── Transport ─────────────────────────────────────────────────────────────
    /// Connection refused, DNS failure, timeout. Retryable; counts toward the breaker.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    /// Raised locally by the circuit breaker without touching the network.
    #[error("Circuit breaker is open. Retry in {retry_after_secs} seconds")]
    CircuitOpen { retry_after_secs: u64 },

    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Authentication required")]
    AuthRequired,

    // ── Jobs ──────────────────────────────────────────────────────────────────
    #[error("Polling timed out for job {job_id} after {attempts} attempts")]
    PollTimeout { job_id: String, attempts: u32 },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// True for connection-level failures, the only class that is retried and
    /// that counts toward opening the circuit.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    /// HTTP status code, if the server responded.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Rate-limit metadata attached to a 429 failure.
    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        match self {
            ApiError::Http { rate_limit, .. } => rate_limit.as_ref(),
            _ => None,
        }
    }

    /// Converts the error into a user-friendly presentation suitable for UI display.
    /// Circuit-open and rate-limit failures get specific wording; everything
    /// else, server messages included, gets the generic one.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            ApiError::CircuitOpen { retry_after_secs } => ErrorPresentation {
                title: "Service Temporarily Unavailable".into(),
                message: format!(
                    "We're having trouble reaching the server. We'll try again in {} seconds.",
                    retry_after_secs
                ),
                action: Some("Wait and retry".into()),
            },

            ApiError::Http {
                status: 429,
                rate_limit,
                ..
            } => {
                let wait_msg = match rate_limit.as_ref().and_then(RateLimitInfo::wait_secs) {
                    Some(secs) => format!("Please wait {} seconds before trying again.", secs),
                    None => "Please wait a moment before trying again.".into(),
                };
                ErrorPresentation {
                    title: "Too Many Requests".into(),
                    message: format!("You've reached the request limit. {}", wait_msg),
                    action: Some("Wait and retry".into()),
                }
            }

            _ => ErrorPresentation {
                title: "Something Went Wrong".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

// Lets callers hand errors straight to a serializing UI bridge.
impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}

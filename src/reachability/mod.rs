//! Server reachability: health report types and the coordinator state machine.

pub mod coordinator;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ApiError;

pub use coordinator::ReachabilityCoordinator;

/// How the server processes submitted jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Background queue; submissions return a job id to poll.
    Queued,
    /// Synchronous; submissions return the result directly.
    #[default]
    Direct,
}

/// Body of the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: Option<String>,
    /// `connected` or `unavailable`.
    pub redis: Option<String>,
    pub mode: Option<String>,
    pub message: Option<String>,
}

impl HealthReport {
    /// Advertised mode; anything but `queued` means direct.
    pub fn processing_mode(&self) -> ProcessingMode {
        match self.mode.as_deref() {
            Some(mode) if mode.eq_ignore_ascii_case("queued") => ProcessingMode::Queued,
            _ => ProcessingMode::Direct,
        }
    }

    pub fn redis_connected(&self) -> bool {
        self.redis.as_deref() == Some("connected")
    }
}

/// Coarse connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Unavailable,
    CircuitOpen,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Unavailable => "unavailable",
            ServerStatus::CircuitOpen => "circuit-open",
            ServerStatus::Error => "error",
        }
    }
}

/// Published reachability state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReachabilityState {
    pub status: ServerStatus,
    pub error_details: Option<String>,
    pub next_retry_at: Option<Instant>,
    pub polling_interval: Duration,
    pub failure_streak: u32,
    pub mode: ProcessingMode,
    pub last_report: Option<HealthReport>,
}

impl ReachabilityState {
    pub fn connecting(polling_interval: Duration) -> Self {
        Self {
            status: ServerStatus::Connecting,
            error_details: None,
            next_retry_at: None,
            polling_interval,
            failure_streak: 0,
            mode: ProcessingMode::Direct,
            last_report: None,
        }
    }

    /// Whole seconds until the next scheduled retry, if any.
    pub fn retry_in_secs(&self) -> Option<u64> {
        let at = self.next_retry_at?;
        let remaining = at.saturating_duration_since(Instant::now());
        Some(remaining.as_millis().div_ceil(1000) as u64)
    }
}

/// Performs one health check; implemented by [`ApiClient`](crate::api::ApiClient).
pub trait HealthSource: Send + Sync {
    fn check_health(&self)
        -> Pin<Box<dyn Future<Output = Result<HealthReport, ApiError>> + Send + '_>>;
}

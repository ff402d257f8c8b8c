//! Client configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Durations are stored as milliseconds to keep the serialized form flat.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Environment variable that overrides [`ClientConfig::base_url`].
pub const BASE_URL_ENV: &str = "IMAGE_TOOLS_API_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";

// ─────────────────────────────────────────────────────────────────────────────
// ClientConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level configuration for an [`ApiClient`](crate::api::ApiClient) and
/// the components built on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base URL every request path is joined onto.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
    /// Health endpoint path; never blocked by the circuit breaker.
    pub health_path: String,
    /// Where the session hook sends the user after a 401.
    pub login_path: String,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub poller: PollerConfig,
    pub reachability: ReachabilityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_ms: 30_000,
            health_path: "/health".to_string(),
            login_path: "/login".to_string(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            poller: PollerConfig::default(),
            reachability: ReachabilityConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults with the given base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON document. Missing fields fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json)
            .map_err(|e| ApiError::Internal(format!("Invalid client config: {}", e)))
    }

    /// Reads and parses a JSON config file, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Internal(format!("Failed to read config file: {}", e)))?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Applies `IMAGE_TOOLS_API_URL` when it is set and non-empty.
    pub fn apply_env(&mut self) {
        self.override_base_url(std::env::var(BASE_URL_ENV).ok());
    }

    fn override_base_url(&mut self, value: Option<String>) {
        let Some(url) = value else { return };
        let url = url.trim();
        if !url.is_empty() {
            self.base_url = url.to_string();
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component configs
// ─────────────────────────────────────────────────────────────────────────────

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Consecutive network failures before the circuit opens.
    pub failure_threshold: u32,
    /// Base of the open-window backoff: `base * 2^min(failures, max_exponent)`.
    pub base_backoff_ms: u64,
    pub max_exponent: u32,
    /// Upper bound on the open window.
    pub max_backoff_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_backoff_ms: 5_000,
            max_exponent: 6,
            max_backoff_ms: 120_000,
        }
    }
}

/// Default retry behavior for requests that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Extra attempts after the first one, network errors only.
    pub retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Job status polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollerConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Multiplier applied to the backoff factor after a failed fetch.
    pub backoff_multiplier: f64,
    pub max_backoff_factor: f64,
    /// Local safety valve; reaching it fails the job with a timeout.
    pub max_attempts: u32,
    /// Validity window of non-terminal status snapshots.
    pub cache_ttl_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 5_000,
            backoff_multiplier: 1.5,
            max_backoff_factor: 5.0,
            max_attempts: 60,
            cache_ttl_ms: 2_000,
        }
    }
}

impl PollerConfig {
    /// `min(base * factor, max)`.
    pub fn interval_for(&self, backoff_factor: f64) -> Duration {
        let ms = (self.base_interval_ms as f64 * backoff_factor).min(self.max_interval_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Server reachability cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReachabilityConfig {
    /// Steady-state interval while connected.
    pub polling_interval_ms: u64,
    pub max_polling_interval_ms: u64,
    pub backoff_multiplier: f64,
    /// Failures tolerated before the interval starts growing.
    pub failure_streak_threshold: u32,
    /// Offsets of the initial connection burst.
    pub initial_burst_ms: Vec<u64>,
    /// Used when a circuit-open error carries no retry hint.
    pub default_circuit_retry_secs: u64,
    /// Countdown tick while the circuit is open.
    pub countdown_tick_ms: u64,
    /// Minimum spacing between logged health-check failures.
    pub failure_log_interval_ms: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 30_000,
            max_polling_interval_ms: 300_000,
            backoff_multiplier: 1.5,
            failure_streak_threshold: 2,
            initial_burst_ms: vec![0, 1_000, 2_000],
            default_circuit_retry_secs: 30,
            countdown_tick_ms: 1_000,
            failure_log_interval_ms: 60_000,
        }
    }
}

impl ReachabilityConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn max_polling_interval(&self) -> Duration {
        Duration::from_millis(self.max_polling_interval_ms)
    }
}

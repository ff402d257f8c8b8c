//! Circuit breaker shared by every request made through one
//! [`ConnectionContext`](crate::state::ConnectionContext).
//!
//! # States
//!
//! ```text
//! Closed    --(failure_count >= threshold)-->  Open
//! Open      --(now >= next_attempt_at)------>  HalfOpen (one probe admitted)
//! HalfOpen  --(probe succeeds)-------------->  Closed
//! HalfOpen  --(probe hits a network error)-->  Open (longer window)
//! ```
//!
//! Only network-class failures count. An HTTP error response proves the
//! server is reachable and leaves the failure count untouched.
//!
//! Half-open probes are serialized: while one probe is in flight every other
//! caller is rejected with [`ApiError::CircuitOpen`]. The probe slot is held by
//! a [`ProbeGuard`], so a probe whose future is dropped mid-flight frees the
//! slot instead of wedging the breaker.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::ApiError;

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BreakerState {
    is_open: bool,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped on every probe admission so stale guards cannot release a newer probe.
    probe_epoch: u64,
}

/// Point-in-time copy of the breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub is_open: bool,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub next_attempt_at: Option<Instant>,
    pub probe_in_flight: bool,
}

/// Outcome of the gate check for one request.
enum Gate {
    Pass,
    Probe(u64),
    Blocked(Duration),
}

/// Permission to send one request.
#[derive(Debug)]
pub enum Admission {
    /// Circuit closed, or the request is exempt.
    Pass,
    /// The single half-open probe. Hold it until the outcome is recorded.
    Probe(ProbeGuard),
}

// ─────────────────────────────────────────────────────────────────────────────
// CircuitBreaker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: BreakerConfig,
    health_path: String,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, health_path: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            config,
            health_path: health_path.into(),
        }
    }

    /// Length of the open window after `failures` consecutive network failures:
    /// `min(base * 2^min(failures, max_exponent), max)`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.config.max_exponent);
        let ms = self
            .config
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Returns true when a request to `endpoint` would fail fast right now.
    ///
    /// Read-only: an elapsed window reports `false` only while no probe is in
    /// flight, but the probe slot is claimed by [`admit`](Self::admit) alone.
    pub fn should_block(&self, endpoint: &str, bypass: bool) -> bool {
        if bypass || self.is_health_path(endpoint) {
            return false;
        }

        let state = self.state.lock();
        if !state.is_open {
            return false;
        }
        let in_window = state
            .next_attempt_at
            .is_some_and(|next| Instant::now() < next);
        in_window || state.probe_in_flight
    }

    /// Gate check that returns a guard for half-open probes.
    pub fn admit(self: &Arc<Self>, endpoint: &str, bypass: bool) -> Result<Admission, ApiError> {
        match self.gate(endpoint, bypass) {
            Gate::Pass => Ok(Admission::Pass),
            Gate::Probe(epoch) => Ok(Admission::Probe(ProbeGuard {
                breaker: Arc::clone(self),
                epoch,
            })),
            Gate::Blocked(remaining) => Err(ApiError::CircuitOpen {
                retry_after_secs: ceil_secs(remaining),
            }),
        }
    }

    fn gate(&self, endpoint: &str, bypass: bool) -> Gate {
        if bypass || self.is_health_path(endpoint) {
            return Gate::Pass;
        }

        let mut state = self.state.lock();
        if !state.is_open {
            return Gate::Pass;
        }

        let now = Instant::now();
        if let Some(next) = state.next_attempt_at {
            if now < next {
                return Gate::Blocked(next - now);
            }
        }

        if state.probe_in_flight {
            return Gate::Blocked(Duration::ZERO);
        }

        state.probe_in_flight = true;
        state.probe_epoch += 1;
        info!(
            "[BREAKER] Half-open, admitting probe after {} failures",
            state.failure_count
        );
        Gate::Probe(state.probe_epoch)
    }

    /// Any successful response closes the circuit unconditionally.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        if state.is_open || state.failure_count > 0 {
            info!(
                "[BREAKER] Closed after success (previous failures: {})",
                state.failure_count
            );
        }
        state.is_open = false;
        state.failure_count = 0;
        state.last_failure_at = None;
        state.next_attempt_at = None;
        state.probe_in_flight = false;
    }

    /// Records a connection-level failure and opens the circuit at the threshold.
    pub fn on_network_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);
        state.probe_in_flight = false;

        if state.failure_count >= self.config.failure_threshold {
            let window = self.backoff_for(state.failure_count);
            state.is_open = true;
            state.next_attempt_at = Some(now + window);
            warn!(
                "[BREAKER] Open after {} network failures, next attempt in {}s",
                state.failure_count,
                ceil_secs(window)
            );
        }
    }

    /// Manual reset to the closed state.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::default();
    }

    /// Time left in the open window, or `None` when requests may proceed.
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock();
        if !state.is_open {
            return None;
        }
        let now = Instant::now();
        state
            .next_attempt_at
            .filter(|next| now < *next)
            .map(|next| next - now)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            is_open: state.is_open,
            failure_count: state.failure_count,
            last_failure_at: state.last_failure_at,
            next_attempt_at: state.next_attempt_at,
            probe_in_flight: state.probe_in_flight,
        }
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    fn is_health_path(&self, endpoint: &str) -> bool {
        let path = endpoint.split('?').next().unwrap_or(endpoint);
        path == self.health_path
    }

    fn release_probe(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.probe_in_flight && state.probe_epoch == epoch {
            state.probe_in_flight = false;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProbeGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Holds the half-open probe slot; frees it on drop if the probe's outcome was
/// never recorded (HTTP error response, dropped future).
#[derive(Debug)]
pub struct ProbeGuard {
    breaker: Arc<CircuitBreaker>,
    epoch: u64,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.breaker.release_probe(self.epoch);
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig::default(), "/health"))
    }

    fn fail_n(breaker: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            breaker.on_network_failure();
        }
    }

    #[test]
    fn backoff_follows_capped_exponential() {
        let config = BreakerConfig {
            max_backoff_ms: u64::MAX,
            ..BreakerConfig::default()
        };
        let uncapped = CircuitBreaker::new(config, "/health");
        assert_eq!(uncapped.backoff_for(0), Duration::from_millis(5_000));
        assert_eq!(uncapped.backoff_for(3), Duration::from_millis(40_000));
        assert_eq!(uncapped.backoff_for(6), Duration::from_millis(320_000));
        // Exponent stops growing at 6.
        assert_eq!(uncapped.backoff_for(9), Duration::from_millis(320_000));

        let capped = breaker();
        for n in 0..12 {
            let expected = (5_000u64 * 2u64.pow(n.min(6))).min(120_000);
            assert_eq!(capped.backoff_for(n), Duration::from_millis(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_threshold() {
        let breaker = breaker();
        fail_n(&breaker, 4);

        let snap = breaker.snapshot();
        assert!(!snap.is_open);
        assert_eq!(snap.failure_count, 4);
        assert!(!breaker.should_block("/images/status/1", false));
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_five_failures_and_blocks() {
        let breaker = breaker();
        fail_n(&breaker, 5);

        assert!(breaker.snapshot().is_open);
        assert!(breaker.should_block("/images/status/1", false));
        assert!(matches!(
            breaker.admit("/images/archive", false),
            Err(ApiError::CircuitOpen { retry_after_secs: 120 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn health_and_bypass_are_never_blocked() {
        let breaker = breaker();
        fail_n(&breaker, 7);

        assert!(!breaker.should_block("/health", false));
        assert!(!breaker.should_block("/health?verbose=1", false));
        assert!(!breaker.should_block("/images/status/1", true));
        assert!(breaker.should_block("/healthz", false));
    }

    #[tokio::test(start_paused = true)]
    async fn open_window_matches_formula() {
        let config = BreakerConfig {
            failure_threshold: 2,
            base_backoff_ms: 1_000,
            max_exponent: 6,
            max_backoff_ms: 1_000_000,
        };
        let breaker = CircuitBreaker::new(config, "/health");
        breaker.on_network_failure();
        assert!(!breaker.snapshot().is_open);

        for n in 2..=8u32 {
            breaker.on_network_failure();
            tokio::time::advance(Duration::from_millis(10)).await;
            let snap = breaker.snapshot();
            assert_eq!(snap.failure_count, n);
            let window = snap.next_attempt_at.unwrap() - snap.last_failure_at.unwrap();
            let expected = 1_000u64 * 2u64.pow(n.min(6));
            assert_eq!(window, Duration::from_millis(expected), "failures = {}", n);
            assert!(snap.is_open);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_window_matches_formula_with_defaults() {
        let breaker = breaker();
        for n in 1..=9u32 {
            breaker.on_network_failure();
            let snap = breaker.snapshot();
            assert_eq!(snap.failure_count, n);
            if n < 5 {
                assert!(snap.next_attempt_at.is_none());
                continue;
            }
            let window = snap.next_attempt_at.unwrap() - snap.last_failure_at.unwrap();
            let expected = (5_000u64 * 2u64.pow(n.min(6))).min(120_000);
            assert_eq!(window, Duration::from_millis(expected), "failures = {}", n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_everything() {
        let breaker = breaker();
        fail_n(&breaker, 9);
        breaker.on_success();

        let snap = breaker.snapshot();
        assert!(!snap.is_open);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.last_failure_at.is_none());
        assert!(snap.next_attempt_at.is_none());
        assert!(!breaker.should_block("/images/status/1", false));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_probe() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(121)).await;

        assert!(!breaker.should_block("/a", false));
        let probe = breaker.admit("/a", false).unwrap();
        assert!(matches!(probe, Admission::Probe(_)), "first caller probes");
        assert!(breaker.should_block("/b", false), "second caller waits");
        assert!(breaker.admit("/b", false).is_err());
        assert!(breaker.admit("/c", false).is_err());

        breaker.on_success();
        drop(probe);
        assert!(!breaker.should_block("/b", false));
        assert!(matches!(breaker.admit("/b", false), Ok(Admission::Pass)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_block_never_claims_the_probe_slot() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(121)).await;

        assert!(!breaker.should_block("/a", false));
        assert!(!breaker.should_block("/a", false));
        assert!(!breaker.snapshot().probe_in_flight);

        // An HTTP error on the checked request records nothing; the next
        // caller can still probe.
        assert!(matches!(breaker.admit("/b", false), Ok(Admission::Probe(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_new_window() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(121)).await;

        let admission = breaker.admit("/a", false).unwrap();
        assert!(matches!(admission, Admission::Probe(_)));
        breaker.on_network_failure();
        drop(admission);

        let snap = breaker.snapshot();
        assert!(snap.is_open);
        assert_eq!(snap.failure_count, 6);
        assert!(breaker.should_block("/a", false));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_releases_slot() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(121)).await;

        let probe = breaker.admit("/a", false).unwrap();
        assert!(breaker.snapshot().probe_in_flight);
        assert!(breaker.admit("/b", false).is_err());

        drop(probe);
        assert!(!breaker.snapshot().probe_in_flight);
        assert!(matches!(breaker.admit("/b", false), Ok(Admission::Probe(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_guard_does_not_release_newer_probe() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(121)).await;

        let first = breaker.admit("/a", false).unwrap();
        breaker.on_network_failure();
        tokio::time::advance(Duration::from_secs(121)).await;

        let second = breaker.admit("/b", false).unwrap();
        drop(first);
        assert!(breaker.snapshot().probe_in_flight, "newer probe still owns the slot");
        drop(second);
        assert!(!breaker.snapshot().probe_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_counts_down() {
        let breaker = breaker();
        assert!(breaker.retry_after().is_none());

        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(breaker.retry_after(), Some(Duration::from_secs(100)));

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(breaker.retry_after().is_none());
    }
}

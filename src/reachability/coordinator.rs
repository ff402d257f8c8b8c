//! Reachability state machine.
//!
//! Checks the health endpoint on an adaptive cadence and publishes a
//! [`ReachabilityState`] on a `watch` channel. It only informs callers; job
//! polls are never gated on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthReport, HealthSource, ProcessingMode, ReachabilityState, ServerStatus};
use crate::config::ReachabilityConfig;
use crate::error::{sanitize_message, ApiError};
use crate::logging::LogThrottle;

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Elapsed,
    /// `retry_connection` was called.
    Woken,
    Cancelled,
}

/// Owns the reachability state and the background monitor loop.
pub struct ReachabilityCoordinator {
    source: Arc<dyn HealthSource>,
    config: ReachabilityConfig,
    state_tx: watch::Sender<ReachabilityState>,
    wake: Notify,
    monitor_running: AtomicBool,
    failure_log: Mutex<LogThrottle>,
}

impl ReachabilityCoordinator {
    pub fn new(source: Arc<dyn HealthSource>, config: ReachabilityConfig) -> Self {
        let (state_tx, _) = watch::channel(ReachabilityState::connecting(config.polling_interval()));
        let failure_log = LogThrottle::new(Duration::from_millis(config.failure_log_interval_ms));
        Self {
            source,
            config,
            state_tx,
            wake: Notify::new(),
            monitor_running: AtomicBool::new(false),
            failure_log: Mutex::new(failure_log),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReachabilityState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ReachabilityState {
        self.state_tx.borrow().clone()
    }

    /// Mode advertised by the last check; `Direct` unless the server is
    /// connected and reported `queued`.
    pub fn processing_mode(&self) -> ProcessingMode {
        self.state_tx.borrow().mode
    }

    /// Runs one health check and returns the resulting state.
    pub async fn check_now(&self) -> ReachabilityState {
        let result = self.source.check_health().await;
        self.apply(result);
        self.state()
    }

    /// Checks the server and returns its processing mode. Never fails: an
    /// unreachable server means `Direct`.
    pub async fn fetch_processing_mode(&self) -> ProcessingMode {
        self.check_now().await.mode
    }

    /// Resets to `connecting`, clears backoff and checks at once.
    ///
    /// Works with or without a spawned monitor. A running monitor is woken
    /// afterwards and restarts its burst from the second offset, since this
    /// call already made the first check.
    pub async fn retry_connection(&self) -> ReachabilityState {
        info!("[HEALTH] Manual reconnect requested");
        self.state_tx
            .send_replace(ReachabilityState::connecting(self.config.polling_interval()));
        self.failure_log.lock().reset();

        let state = self.check_now().await;
        if self.monitor_running.load(Ordering::SeqCst) {
            self.wake.notify_one();
        }
        state
    }

    /// Starts the monitor loop. It stops when `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) {
        debug!("[HEALTH] Monitor started");
        let _running = MonitorFlag::raise(&self.monitor_running);
        // Burst offsets to skip; `None` outside a burst.
        let mut burst = Some(0);

        loop {
            let wait = match burst.take() {
                Some(skip) => self.initial_burst(skip, &cancel).await,
                None => {
                    let wait = self.wait_for_next_check(&cancel).await;
                    if wait == Wait::Elapsed {
                        self.check_now().await;
                    }
                    wait
                }
            };

            match wait {
                Wait::Cancelled => break,
                Wait::Woken => burst = Some(1),
                Wait::Elapsed => {}
            }
        }
        debug!("[HEALTH] Monitor stopped");
    }

    /// Checks at each burst offset after the first `skip` until one succeeds.
    async fn initial_burst(&self, skip: usize, cancel: &CancellationToken) -> Wait {
        if skip > 0 && self.state().status == ServerStatus::Connected {
            return Wait::Elapsed;
        }

        let mut elapsed = Duration::ZERO;
        for offset_ms in self.config.initial_burst_ms.iter().skip(skip) {
            let offset = Duration::from_millis(*offset_ms);
            let delay = offset.saturating_sub(elapsed);
            elapsed = elapsed.max(offset);

            if !delay.is_zero() {
                let wait = self.sleep_or_wake(delay, cancel).await;
                if wait != Wait::Elapsed {
                    return wait;
                }
            }
            if self.check_now().await.status == ServerStatus::Connected {
                break;
            }
        }
        Wait::Elapsed
    }

    /// Steady cadence, or the one-second countdown while the circuit is open.
    async fn wait_for_next_check(&self, cancel: &CancellationToken) -> Wait {
        let state = self.state();
        if state.status != ServerStatus::CircuitOpen {
            return self.sleep_or_wake(state.polling_interval, cancel).await;
        }

        let tick = Duration::from_millis(self.config.countdown_tick_ms);
        loop {
            match state.next_retry_at {
                Some(at) if Instant::now() < at => {}
                _ => return Wait::Elapsed,
            }
            let wait = self.sleep_or_wake(tick, cancel).await;
            if wait != Wait::Elapsed {
                return wait;
            }
        }
    }

    async fn sleep_or_wake(&self, duration: Duration, cancel: &CancellationToken) -> Wait {
        tokio::select! {
            _ = cancel.cancelled() => Wait::Cancelled,
            _ = self.wake.notified() => Wait::Woken,
            _ = tokio::time::sleep(duration) => Wait::Elapsed,
        }
    }

    /// Applies one health check outcome to the published state.
    fn apply(&self, result: Result<HealthReport, ApiError>) {
        match result {
            Ok(report) => {
                let previous = self.state_tx.borrow().status;
                let mode = report.processing_mode();
                let polling_interval = self.config.polling_interval();
                self.state_tx.send_modify(|s| {
                    s.status = ServerStatus::Connected;
                    s.error_details = None;
                    s.next_retry_at = None;
                    s.failure_streak = 0;
                    s.polling_interval = polling_interval;
                    s.mode = mode;
                    s.last_report = Some(report);
                });
                self.failure_log.lock().reset();
                if previous != ServerStatus::Connected {
                    info!("[HEALTH] Server reachable (mode: {:?})", mode);
                }
            }
            Err(err) => {
                let now = Instant::now();
                let config = &self.config;
                let details = sanitize_message(&err.to_string(), "Health check failed");

                self.state_tx.send_modify(|s| {
                    s.failure_streak += 1;
                    s.mode = ProcessingMode::Direct;
                    s.error_details = Some(details.clone());
                    s.next_retry_at = None;
                    s.status = match &err {
                        ApiError::CircuitOpen { retry_after_secs } => {
                            let secs = if *retry_after_secs > 0 {
                                *retry_after_secs
                            } else {
                                config.default_circuit_retry_secs
                            };
                            s.next_retry_at = Some(now + Duration::from_secs(secs));
                            ServerStatus::CircuitOpen
                        }
                        ApiError::Network(_) => ServerStatus::Unavailable,
                        _ => ServerStatus::Error,
                    };

                    if s.failure_streak > config.failure_streak_threshold {
                        s.polling_interval = s
                            .polling_interval
                            .mul_f64(config.backoff_multiplier)
                            .min(config.max_polling_interval());
                        if s.status != ServerStatus::CircuitOpen {
                            s.next_retry_at = Some(now + s.polling_interval);
                        }
                    }
                });

                if let Some(suppressed) = self.failure_log.lock().check() {
                    let state = self.state_tx.borrow();
                    warn!(
                        "[HEALTH] Health check failed ({}): {} [streak {}, next check in {}s, {} similar suppressed]",
                        state.status.as_str(),
                        details,
                        state.failure_streak,
                        state.polling_interval.as_secs(),
                        suppressed
                    );
                }
            }
        }
    }
}

/// Marks the monitor as running for as long as it is alive.
struct MonitorFlag<'a>(&'a AtomicBool);

impl<'a> MonitorFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for MonitorFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

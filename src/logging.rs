//! Tracing setup and log throttling.

use std::time::Duration;

use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "image_tools_client=info";

/// Installs a `fmt` subscriber filtered by `RUST_LOG`
/// (default `image_tools_client=info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Lets one log line through per interval and counts the rest.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_since_last)` when the caller should log now.
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_emit = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// Forgets the last emit so the next check logs immediately.
    pub fn reset(&mut self) {
        self.last_emit = None;
        self.suppressed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throttle_counts_suppressed_lines() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));

        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(throttle.check(), Some(2));
        assert_eq!(throttle.check(), None);

        throttle.reset();
        assert_eq!(throttle.check(), Some(0));
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}

//! Shared connection state.
//!
//! Everything that must be shared across all calls to one backend lives here,
//! so tests and separate backends can each own an independent instance.

use std::sync::Arc;

use crate::api::circuit_breaker::CircuitBreaker;
use crate::config::ClientConfig;

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionContext
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by every client that talks to the same backend.
///
/// Cloning an [`ApiClient`](crate::api::ApiClient) shares its context; building
/// a second context gives a fully independent breaker.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Circuit breaker gating all requests to this backend.
    pub breaker: Arc<CircuitBreaker>,
    /// Configuration the context was built from.
    pub config: Arc<ClientConfig>,
}

impl ConnectionContext {
    pub fn new(config: ClientConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone(), config.health_path.clone());
        Self {
            breaker: Arc::new(breaker),
            config: Arc::new(config),
        }
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_do_not_share_breakers() {
        let a = ConnectionContext::default();
        let b = ConnectionContext::default();

        for _ in 0..5 {
            a.breaker.on_network_failure();
        }

        assert!(a.breaker.snapshot().is_open);
        assert!(!b.breaker.snapshot().is_open);
    }

    #[test]
    fn clones_share_the_breaker() {
        let a = ConnectionContext::default();
        let b = a.clone();
        a.breaker.on_network_failure();
        assert_eq!(b.breaker.snapshot().failure_count, 1);
    }
}

//! HTTP layer: circuit breaker, request executor and typed endpoints.

pub mod circuit_breaker;
pub mod client;
pub mod endpoints;

pub use circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, ProbeGuard};
pub use client::{
    parse_rate_limit, sanitize_url_for_logs, ApiClient, FormPart, LoggingMode, RequestBody,
    RequestDescriptor,
};
pub use endpoints::ArchiveEntry;

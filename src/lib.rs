//! Resilient client for the image tools backend.
//!
//! All calls go through one [`ApiClient`], gated by a per-backend
//! [`CircuitBreaker`](api::CircuitBreaker) held in a [`ConnectionContext`].
//! [`JobTracker`] submits files and follows their background jobs through a
//! [`JobPoller`]; [`ReachabilityCoordinator`] watches the health endpoint and
//! advertises the server's processing mode.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod reachability;
pub mod state;

pub use api::{ApiClient, RequestDescriptor};
pub use auth::{CredentialStore, MemoryCredentialStore, SessionHooks};
pub use config::ClientConfig;
pub use error::{ApiError, ErrorPresentation, RateLimitInfo};
pub use jobs::{JobPoller, JobTracker, ToolType, UploadFile};
pub use reachability::{ProcessingMode, ReachabilityCoordinator, ServerStatus};
pub use state::ConnectionContext;

//! Credential and session collaborators.
//!
//! Where tokens are stored and how the user is sent to a login page belong to
//! the embedding application. The client only needs to read the current bearer
//! token, drop it on a 401, and notify the application.
//!
//! Tokens are held as `SecretString` and never logged.

use std::fmt;

use parking_lot::RwLock;
use secrecy::SecretString;

// ─────────────────────────────────────────────────────────────────────────────
// CredentialStore
// ─────────────────────────────────────────────────────────────────────────────

/// Source of the bearer token attached to authenticated requests.
pub trait CredentialStore: Send + Sync {
    /// Current access token, if the user is signed in.
    fn access_token(&self) -> Option<SecretString>;

    /// Forget the stored credential (called after a 401).
    fn clear(&self);
}

/// In-memory credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<SecretString>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(SecretString::from(token.into()))),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(SecretString::from(token.into()));
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }
}

impl fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("token", &self.token.read().as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<SecretString> {
        self.token.read().clone()
    }

    fn clear(&self) {
        *self.token.write() = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionHooks
// ─────────────────────────────────────────────────────────────────────────────

/// Why the client is asking for a login redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRedirectReason {
    /// No credential was available for a request that requires one.
    MissingCredential,
    /// The server rejected the credential with a 401.
    Unauthorized,
}

/// Side effects the client triggers on auth failures.
pub trait SessionHooks: Send + Sync {
    /// Send the user to the login entry point.
    fn redirect_to_login(&self, login_path: &str, reason: AuthRedirectReason);
}

/// Hooks that do nothing; for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionHooks;

impl SessionHooks for NoopSessionHooks {
    fn redirect_to_login(&self, _login_path: &str, _reason: AuthRedirectReason) {}
}

//! Common error types for calsync.

use thiserror::Error;

/// Top-level error type for calsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable access credential for the user.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// A sync job is already running for the user.
    #[error("Sync already running: {0}")]
    AlreadyRunning(String),

    /// The remote provider rejected a continuation token as expired or invalid.
    #[error("Continuation token invalid: {0}")]
    TokenInvalid(String),

    /// Transport-level failure talking to the remote provider.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote provider is throttling requests.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A remote call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The conflict cannot be resolved automatically.
    #[error("Manual resolution required: {0}")]
    ManualResolutionRequired(String),

    /// Invalid input provided to a public operation.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Repository or state-store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this failure is transient and worth retrying.
    ///
    /// Token invalidation is deliberately not transient: retrying the same
    /// token cannot succeed, the caller must fall back to a full sync.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RateLimited(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(Error::RateLimited("429".into()).is_transient());
        assert!(Error::Timeout("fetch page".into()).is_transient());

        assert!(!Error::TokenInvalid("expired".into()).is_transient());
        assert!(!Error::NotAuthenticated("no token".into()).is_transient());
        assert!(!Error::Validation("bad direction".into()).is_transient());
        assert!(!Error::ManualResolutionRequired("3 fields".into()).is_transient());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::Serialization(_)));
    }
}

//! Error types for the Gatekeeper service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// Store failures are normally absorbed by the rate limiter's fallback logic;
/// only configuration problems are expected to reach callers.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid configuration (bad limits, malformed files, bad overrides)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A route class that is not present in the registry
    #[error("Configuration error: unknown route class '{0}'")]
    UnknownRoute(String),

    /// Window store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error is a fatal configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnknownRoute(_))
    }
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Errors raised by a window store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or did not answer in time.
    #[error("{store} store unavailable: {reason}")]
    Unavailable { store: &'static str, reason: String },
}

impl StoreError {
    pub fn unavailable(store: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            store,
            reason: reason.into(),
        }
    }

    pub fn timeout(store: &'static str, after: Duration) -> Self {
        Self::unavailable(store, format!("timed out after {}ms", after.as_millis()))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::unavailable("redis", err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_flagged() {
        assert!(GatekeeperError::Config("bad".into()).is_configuration());
        assert!(GatekeeperError::UnknownRoute("nope".into()).is_configuration());
        assert!(!GatekeeperError::Store(StoreError::unavailable("redis", "down")).is_configuration());
    }

    #[test]
    fn test_timeout_message() {
        let err = StoreError::timeout("redis", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "redis store unavailable: timed out after 1500ms");
    }
}

//! Error types for session coordination and its collaborators.

use thiserror::Error;

/// Errors raised by lock and history store backends.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the chat transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Errors raised by the completion service.
#[derive(Error, Debug, Clone)]
pub enum CompletionError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Parse(String),
}

/// Errors raised by the account store and quota gate.
#[derive(Error, Debug, Clone)]
pub enum AccountError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("User not found: {0}")]
    NotFound(i64),
}

/// Failures of the coordination core.
///
/// Reaching the history limit is not an error; it surfaces as
/// [`crate::BeforeCheck::Blocked`] or [`crate::AfterCheck`].
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The lock store could not be reached. Processing must not proceed.
    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(#[source] StoreError),

    /// The history store could not be reached.
    #[error("History store unavailable: {0}")]
    HistoryUnavailable(#[source] StoreError),

    /// The completion service failed.
    #[error("Downstream failure: {0}")]
    DownstreamFailure(#[source] CompletionError),
}

impl SessionError {
    /// Short machine-readable label, used when recording errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CoordinationUnavailable(_) => "coordination_unavailable",
            Self::HistoryUnavailable(_) => "history_unavailable",
            Self::DownstreamFailure(_) => "downstream_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_kind() {
        let err = SessionError::CoordinationUnavailable(StoreError::Connection("refused".into()));
        assert_eq!(err.kind(), "coordination_unavailable");
        assert_eq!(
            err.to_string(),
            "Coordination store unavailable: Connection error: refused"
        );
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(
            StoreError::from(json_err),
            StoreError::Serialization(_)
        ));
    }
}

//! Common error types for TwinSync.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for TwinSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote store could not be reached.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Credentials were rejected by the remote store.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A record was rejected as malformed.
    #[error("Data validation failed: {0}")]
    Validation(String),

    /// Local store query or save failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A Record points at a Contact that does not exist on either side.
    #[error("Relationship integrity violation: record {record_id} references {}", display_parent(.contact_id))]
    RelationshipIntegrity {
        record_id: Uuid,
        contact_id: Option<Uuid>,
    },

    /// Another sync pass is already running.
    #[error("Concurrent modification: a sync is already in progress")]
    ConcurrentModification,

    /// The operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The remote store throttled the request.
    #[error("Rate limited by remote store")]
    RateLimited,

    /// The remote store answered with an error status.
    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    /// A retryable operation kept failing.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<Error> },

    /// No connection was available to serve the request.
    #[error("Connection pool exhausted")]
    ConnectionPoolExhausted,

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The pass was cancelled before it finished.
    #[error("Sync cancelled")]
    Cancelled,

    /// Anything the taxonomy does not name.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

fn display_parent(contact_id: &Option<Uuid>) -> String {
    match contact_id {
        Some(id) => format!("missing contact {}", id),
        None => "no contact".to_string(),
    }
}

impl Error {
    /// Whether a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NetworkUnavailable(_)
            | Error::Timeout
            | Error::RateLimited
            | Error::ConnectionPoolExhausted => true,
            Error::Server { code, .. } => *code == 0 || *code >= 500,
            _ => false,
        }
    }

    /// The underlying cause, looking through retry exhaustion.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
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
    fn test_retryable_classification() {
        assert!(Error::NetworkUnavailable("down".to_string()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::RateLimited.is_retryable());
        assert!(Error::Server { code: 503, message: "busy".to_string() }.is_retryable());
        assert!(Error::Server { code: 0, message: "reset".to_string() }.is_retryable());

        assert!(!Error::Server { code: 404, message: "gone".to_string() }.is_retryable());
        assert!(!Error::AuthenticationFailed("bad token".to_string()).is_retryable());
        assert!(!Error::Validation("bad row".to_string()).is_retryable());
        assert!(!Error::ConcurrentModification.is_retryable());
    }

    #[test]
    fn test_root_unwraps_exhaustion() {
        let err = Error::RetryExhausted {
            attempts: 4,
            last: Box::new(Error::Timeout),
        };
        assert!(matches!(err.root(), Error::Timeout));
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_integrity_message() {
        let record_id = Uuid::new_v4();
        let err = Error::RelationshipIntegrity {
            record_id,
            contact_id: None,
        };
        assert!(err.to_string().contains(&record_id.to_string()));
        assert!(err.to_string().contains("no contact"));
    }
}

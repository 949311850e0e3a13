//! Discovery error types.

use thiserror::Error;

/// Result type for discovery client operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors surfaced by [`DiscoveryClient`](crate::DiscoveryClient).
///
/// Operation variants keep the backend failure as their source so callers can
/// inspect the transport or status error behind a failed call.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Missing or invalid configuration.
    #[error("invalid discovery config: {0}")]
    Config(String),

    /// The backend handle could not be created.
    #[error("create consul client failed: {0}")]
    Connection(String),

    /// The backend rejected a service registration.
    #[error("register service failed: {0}")]
    Registration(#[source] BackendError),

    /// The backend failed to remove a registration.
    #[error("deregister service failed: {0}")]
    Deregistration(#[source] BackendError),

    /// A service query failed.
    #[error("discover service failed: {0}")]
    Discovery(#[source] BackendError),

    /// A key-value operation failed.
    #[error("{op} kv failed: {source}")]
    Kv {
        /// Which KV operation failed (`get`, `put`, `delete`).
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// Absent key, unknown service ID, or an empty healthy set.
    #[error("not found: {0}")]
    NotFound(String),
}

impl DiscoveryError {
    pub(crate) fn kv(op: &'static str, source: BackendError) -> Self {
        Self::Kv { op, source }
    }

    /// Check if this error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error came from configuration validation.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Failure reported by a [`DiscoveryBackend`](crate::DiscoveryBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level failure talking to the agent.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The agent answered with a non-success status.
    #[error("unexpected response: {status} - {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, trimmed.
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The backend is unreachable or refused the call.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The key cannot be addressed (`.` or `..` segments).
    #[error("invalid key {0:?}")]
    InvalidKey(String),
}

impl BackendError {
    /// HTTP status code, if the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_context_in_message() {
        let err = DiscoveryError::kv("get", BackendError::Unavailable("refused".into()));
        assert_eq!(err.to_string(), "get kv failed: backend unavailable: refused");

        let err = DiscoveryError::Registration(BackendError::Status {
            status: 400,
            message: "Invalid check".into(),
        });
        assert!(err.to_string().starts_with("register service failed"));
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(DiscoveryError::NotFound("key".into()).is_not_found());
        assert!(!DiscoveryError::Config("x".into()).is_not_found());
        assert!(DiscoveryError::Config("x".into()).is_config());
    }

    #[test]
    fn test_status_code() {
        let err = BackendError::Status {
            status: 503,
            message: String::new(),
        };
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(BackendError::Decode("bad".into()).status_code(), None);
    }
}

//! Error types for burrow-engine.

use thiserror::Error;

/// Result type alias for burrow-engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by a container engine.
///
/// The adapter never retries; each failure is reported to the caller
/// exactly as the engine produced it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be reached (socket missing, connection refused, timeout).
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The referenced container (or exec instance) does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The engine refused the request (name collision, bad image, container not running...).
    #[error("engine rejected request (status {status}): {message}")]
    Rejected {
        /// HTTP status code returned by the engine API.
        status: u16,
        /// Engine-provided message.
        message: String,
    },

    /// The attached exec stream could not be established or broke mid-session.
    #[error("exec stream error: {0}")]
    Stream(String),
}

impl EngineError {
    /// Whether the failure is a transient infrastructure fault.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match err {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::ContainerNotFound(message),
            B::DockerResponseServerError {
                status_code,
                message,
            } => Self::Rejected {
                status: status_code,
                message,
            },
            B::DockerStreamError { error } => Self::Stream(error),
            B::JsonDataError { message, .. } => {
                Self::Stream(format!("malformed engine response: {message}"))
            }
            B::JsonSerdeError { err } => {
                Self::Stream(format!("malformed engine response: {err}"))
            }
            // Everything else is transport-level: socket, TLS, HTTP client, timeout.
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mapping() {
        let err: EngineError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        }
        .into();
        assert!(matches!(err, EngineError::ContainerNotFound(ref m) if m.contains("abc")));
    }

    #[test]
    fn test_conflict_maps_to_rejected() {
        let err: EngineError = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        }
        .into();
        assert!(matches!(err, EngineError::Rejected { status: 409, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_is_transient() {
        let err: EngineError = bollard::errors::Error::RequestTimeoutError.into();
        assert!(err.is_transient());
    }
}

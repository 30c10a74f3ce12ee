//! Error types for burrow-core.

use crate::instance::{InstanceId, OwnerId};
use burrow_engine::EngineError;
use thiserror::Error;

/// Result type alias for burrow-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during instance and session operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The container engine could not be reached. Safe to retry.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The registry points at a container the engine does not know.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// No registry record for this instance id.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The engine refused the request; retrying with the same input will not help.
    #[error("engine rejected request: {0}")]
    EngineRejected(String),

    /// The exec stream could not be established.
    #[error("exec stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Requester does not own the instance.
    #[error("{requester} does not own instance {instance}")]
    NotOwner {
        instance: InstanceId,
        requester: OwnerId,
    },

    /// Container was stopped but could not be removed; the record is kept for a retry.
    #[error("instance {instance} only partially torn down: {source}")]
    PartialTeardown {
        instance: InstanceId,
        #[source]
        source: EngineError,
    },

    /// Creating or starting the container failed; nothing was recorded.
    #[error("failed to provision instance: {0}")]
    ProvisionFailed(#[source] EngineError),

    /// The session has no writable side into the process.
    #[error("terminal input unavailable")]
    InputUnavailable,

    /// No image is known for the requested OS label.
    #[error("unsupported OS: {0}")]
    UnsupportedOs(String),

    /// Another terminal session is attached to this instance.
    #[error("instance {0} already has an attached session")]
    SessionBusy(InstanceId),

    /// The instance's container exists but is not running.
    #[error("instance {instance} is not running (state: {state})")]
    ContainerNotRunning { instance: InstanceId, state: String },

    /// The instance record has no runtime container yet.
    #[error("instance {0} has no runtime container")]
    NotProvisioned(InstanceId),

    /// A previous decommission left the instance half torn down.
    #[error("instance {0} is awaiting teardown; retry decommission")]
    TeardownPending(InstanceId),

    /// Invalid caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persistence collaborator failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EngineUnavailable(_) | Self::PartialTeardown { .. } | Self::SessionBusy(_)
        ) || matches!(self, Self::ProvisionFailed(e) if e.is_transient())
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => Self::EngineUnavailable(msg),
            EngineError::ContainerNotFound(msg) => Self::ContainerNotFound(msg),
            EngineError::Rejected { status, message } => {
                Self::EngineRejected(format!("{message} (status {status})"))
            }
            EngineError::Stream(msg) => Self::StreamUnavailable(msg),
        }
    }
}

/// Errors from an [`InstanceStore`](crate::InstanceStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this id already exists.
    #[error("duplicate instance id: {0}")]
    Duplicate(InstanceId),

    /// Update of a record that does not exist.
    #[error("no record for instance {0}")]
    Missing(InstanceId),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_translation() {
        let err: CoreError = EngineError::Unavailable("socket".into()).into();
        assert!(matches!(err, CoreError::EngineUnavailable(_)));
        assert!(err.is_retryable());

        let err: CoreError = EngineError::ContainerNotFound("abc".into()).into();
        assert!(matches!(err, CoreError::ContainerNotFound(ref m) if m == "abc"));
        assert!(!err.is_retryable());

        let err: CoreError = EngineError::Rejected {
            status: 409,
            message: "conflict".into(),
        }
        .into();
        assert!(matches!(err, CoreError::EngineRejected(ref m) if m.contains("409")));
    }

    #[test]
    fn test_partial_teardown_is_retryable() {
        let err = CoreError::PartialTeardown {
            instance: InstanceId::new(),
            source: EngineError::Rejected {
                status: 500,
                message: "device busy".into(),
            },
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("partially torn down"));
    }
}

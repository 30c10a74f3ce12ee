//! The container engine seam.

use crate::config::{ContainerSpec, ExecSpec};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Control operations against a container runtime.
///
/// Every method is a single call-through: no retries, no state of its own.
/// Implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List every container the engine knows about, running or not.
    async fn list_all(&self) -> Result<Vec<ContainerSummary>>;

    /// Create a container and return its engine-assigned id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created or stopped container. Starting a running container is a no-op.
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Stop a container, waiting up to `grace` before killing it.
    /// Stopping a stopped container is a no-op.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Restart a container (starts it if it was stopped).
    async fn restart(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Remove a container.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Inspect the runtime state of a container.
    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus>;

    /// Register a process to run inside a container; returns the exec id.
    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> Result<String>;

    /// Start a registered exec and attach to its streams.
    async fn exec_start(&self, exec_id: &str) -> Result<ExecChannel>;

    /// Resize the TTY of an exec.
    async fn exec_resize(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()>;
}

/// Raw engine state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// A state string this adapter does not know.
    Other(String),
}

impl RawState {
    /// Parse the engine's lowercase state string.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RawState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub state: RawState,
    /// Exit code of the main process, if it has exited.
    pub exit_code: Option<i64>,
    /// RFC 3339 start timestamp as reported by the engine.
    pub started_at: Option<String>,
}

impl ContainerStatus {
    /// Whether the main process is currently running.
    pub fn is_running(&self) -> bool {
        self.state == RawState::Running
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: RawState,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// Value of a label, if set.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Write half of an exec channel.
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Read half of an exec channel: output chunks in engine order.
pub type ExecOutput = BoxStream<'static, Result<Bytes>>;

/// An attached exec: a duplex byte stream into one process.
///
/// The two halves are independent. Dropping `output` detaches from the
/// process output; shutting down `input` delivers end-of-file to the
/// process's stdin.
pub struct ExecChannel {
    pub exec_id: String,
    pub output: ExecOutput,
    /// `None` when the engine did not provide a writable side.
    pub input: Option<ExecInput>,
}

impl ExecChannel {
    /// Split into id, output and input.
    pub fn into_parts(self) -> (String, ExecOutput, Option<ExecInput>) {
        (self.exec_id, self.output, self.input)
    }
}

impl fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecChannel")
            .field("exec_id", &self.exec_id)
            .field("has_input", &self.input.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_state_parse() {
        assert_eq!(RawState::parse("running"), RawState::Running);
        assert_eq!(RawState::parse("EXITED"), RawState::Exited);
        assert_eq!(
            RawState::parse("frozen"),
            RawState::Other("frozen".to_string())
        );
        assert_eq!(RawState::parse("restarting").to_string(), "restarting");
    }

    #[test]
    fn test_status_is_running() {
        let status = ContainerStatus {
            id: "c1".into(),
            state: RawState::Running,
            exit_code: None,
            started_at: None,
        };
        assert!(status.is_running());
        let stopped = ContainerStatus {
            state: RawState::Exited,
            exit_code: Some(0),
            ..status
        };
        assert!(!stopped.is_running());
    }
}

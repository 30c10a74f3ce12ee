//! Request and response bodies.

use burrow_core::{Instance, InstancePhase, PowerAction, RuntimeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Instances
// ============================================================================

/// Body of `POST /instances`.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    /// Display name.
    pub name: String,
    /// OS label, e.g. `alpine`.
    pub os: String,
}

/// Body of `POST /instances/:id/power`.
#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
}

/// An instance as returned to its owner.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub phase: InstancePhase,
    pub created_at: DateTime<Utc>,
    /// Only present on single-instance lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RuntimeStatus>,
}

impl From<Instance> for InstanceView {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id.to_string(),
            container_id: instance.container_id().map(str::to_string),
            name: instance.display_name,
            os: instance.os_label,
            image: instance.image_reference,
            phase: instance.phase,
            created_at: instance.created_at,
            status: None,
        }
    }
}

impl InstanceView {
    pub fn with_status(mut self, status: RuntimeStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Body of `GET /instances`.
#[derive(Debug, Serialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<InstanceView>,
}

/// Error body for every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

// ============================================================================
// Terminal
// ============================================================================

/// JSON text frames accepted on the terminal WebSocket.
///
/// Binary frames carry raw `terminal-input` bytes and need no envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TerminalMessage {
    TerminalInput { data: String },
    Resize { cols: u16, rows: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::{InstanceId, OwnerId};

    #[test]
    fn test_terminal_message_parsing() {
        let msg: TerminalMessage =
            serde_json::from_str(r#"{"type":"terminal-input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            msg,
            TerminalMessage::TerminalInput {
                data: "ls\n".into()
            }
        );

        let msg: TerminalMessage =
            serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        assert_eq!(msg, TerminalMessage::Resize { cols: 80, rows: 24 });

        assert!(serde_json::from_str::<TerminalMessage>(r#"{"type":"exec"}"#).is_err());
    }

    #[test]
    fn test_power_request_parsing() {
        let req: PowerRequest = serde_json::from_str(r#"{"action":"restart"}"#).unwrap();
        assert_eq!(req.action, PowerAction::Restart);
        assert!(serde_json::from_str::<PowerRequest>(r#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn test_instance_view_shape() {
        let instance = Instance {
            id: InstanceId::new(),
            owner_id: OwnerId::from("u1"),
            display_name: "box1".into(),
            image_reference: "alpine:latest".into(),
            runtime_container_id: Some("c0ffee".into()),
            os_label: Some("alpine".into()),
            phase: InstancePhase::Active,
            created_at: Utc::now(),
        };
        let view = InstanceView::from(instance.clone()).with_status(RuntimeStatus::Running);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], instance.id.to_string());
        assert_eq!(json["name"], "box1");
        assert_eq!(json["status"], "running");
        assert_eq!(json["phase"], "active");
        assert!(json.get("owner_id").is_none());
    }
}

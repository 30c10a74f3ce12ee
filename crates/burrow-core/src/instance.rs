//! Instance records and identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Stable identifier of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Registry-side phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Normal state.
    #[default]
    Active,
    /// Container stopped, removal failed; decommission must be retried.
    TeardownPending,
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::TeardownPending => write!(f, "teardown_pending"),
        }
    }
}

/// One provisioned container, as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub owner_id: OwnerId,
    pub display_name: String,
    pub image_reference: String,
    /// Engine-assigned id; absent until the container is materialized.
    #[serde(default)]
    pub runtime_container_id: Option<String>,
    #[serde(default)]
    pub os_label: Option<String>,
    #[serde(default)]
    pub phase: InstancePhase,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// The runtime container id, if materialized.
    pub fn container_id(&self) -> Option<&str> {
        self.runtime_container_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Whether `requester` owns this instance.
    pub fn is_owned_by(&self, requester: &OwnerId) -> bool {
        &self.owner_id == requester
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Instance {
        Instance {
            id: InstanceId::new(),
            owner_id: OwnerId::from("u1"),
            display_name: "box1".into(),
            image_reference: "alpine:latest".into(),
            runtime_container_id: Some("c0ffee".into()),
            os_label: Some("alpine".into()),
            phase: InstancePhase::Active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_instance_id_display_and_parse() {
        let id = InstanceId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s.parse::<InstanceId>().unwrap(), id);
        assert!("not-a-uuid".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_empty_container_id_is_absent() {
        let mut instance = sample();
        assert_eq!(instance.container_id(), Some("c0ffee"));
        instance.runtime_container_id = Some(String::new());
        assert_eq!(instance.container_id(), None);
    }

    #[test]
    fn test_instance_serde_shape() {
        let instance = sample();
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["owner_id"], "u1");
        assert_eq!(json["phase"], "active");
        assert_eq!(json["id"], instance.id.to_string());

        let back: Instance = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn test_phase_defaults_when_missing() {
        let json = serde_json::json!({
            "id": InstanceId::new().to_string(),
            "owner_id": "u1",
            "display_name": "box",
            "image_reference": "alpine:latest",
            "created_at": "2024-01-01T00:00:00Z"
        });
        let instance: Instance = serde_json::from_value(json).unwrap();
        assert_eq!(instance.phase, InstancePhase::Active);
        assert!(instance.container_id().is_none());
    }
}

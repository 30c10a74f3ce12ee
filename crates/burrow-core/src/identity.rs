//! Identity collaborator seam.

use crate::instance::OwnerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An authenticated user. Only `owner_id` matters to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner_id: OwnerId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Identity {
    pub fn new(owner_id: impl Into<OwnerId>, display_name: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("identity provider error: {0}")]
    Provider(String),
}

/// Resolves an opaque credential to an [`Identity`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_serde_skips_missing_avatar() {
        let identity = Identity::new("1234", "alice");
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json, serde_json::json!({"owner_id": "1234", "display_name": "alice"}));

        let with_avatar = identity.with_avatar("a1b2c3");
        let json = serde_json::to_value(&with_avatar).unwrap();
        assert_eq!(json["avatar"], "a1b2c3");
    }
}

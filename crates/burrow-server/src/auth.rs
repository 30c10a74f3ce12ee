//! Static bearer-token identity provider and the request extractor using it.

use crate::config::ConfigError;
use crate::http::{ApiError, AppState};
use async_trait::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use burrow_core::{AuthError, Identity, IdentityProvider, OwnerId};
use serde::Deserialize;
use std::collections::HashMap;

/// Maps opaque tokens to identities.
///
/// Parsed from `token=owner_id[:display name]` entries separated by commas.
#[derive(Debug, Default, Clone)]
pub struct TokenIdentity {
    tokens: HashMap<String, Identity>,
}

impl TokenIdentity {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut tokens = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, who) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidToken(redact(entry)))?;
            let (owner, name) = match who.split_once(':') {
                Some((owner, name)) => (owner.trim(), name.trim()),
                None => (who.trim(), who.trim()),
            };
            if token.trim().is_empty() || owner.is_empty() {
                return Err(ConfigError::InvalidToken(redact(entry)));
            }
            if tokens
                .insert(token.trim().to_string(), Identity::new(owner, name))
                .is_some()
            {
                return Err(ConfigError::InvalidToken(format!(
                    "duplicate token for owner {owner}"
                )));
            }
        }
        Ok(Self { tokens })
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn redact(entry: &str) -> String {
    match entry.split_once('=') {
        Some((_, who)) => format!("<token>={who}"),
        None => "<entry without '='>".to_string(),
    }
}

#[async_trait]
impl IdentityProvider for TokenIdentity {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)
    }
}

/// The authenticated caller of a request.
///
/// Reads `Authorization: Bearer <token>`, falling back to a `token` query
/// parameter since browsers cannot set headers on WebSocket upgrades.
#[derive(Debug, Clone)]
pub struct Caller(pub Identity);

impl Caller {
    pub fn owner(&self) -> &OwnerId {
        &self.0.owner_id
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn credential(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    bearer.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token)
    })
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let credential = credential(parts).ok_or(AuthError::MissingCredentials)?;
        let identity = state.identity.authenticate(&credential).await?;
        tracing::trace!(owner_id = %identity.owner_id, "Authenticated request");
        Ok(Self(identity))
    }
}

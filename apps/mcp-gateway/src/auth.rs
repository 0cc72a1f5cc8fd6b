use std::collections::HashMap;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use sha2::{Digest, Sha256};

use crate::config::ApiKey;
use crate::error::ApiError;
use crate::model::Actor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("unknown bearer token")]
    Invalid,
}

/// Resolves a client bearer token to the actor it belongs to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Actor, AuthError>;
}

/// Fixed table of API keys loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, Actor>,
}

impl StaticKeyAuthenticator {
    pub fn new(keys: &[ApiKey]) -> Self {
        let keys = keys
            .iter()
            .map(|key| {
                let actor = Actor {
                    organization_id: key.organization_id.clone(),
                    actor_id: format!("key_{}", &fingerprint(&key.token)[..12]),
                };
                (key.token.clone(), actor)
            })
            .collect();
        Self { keys }
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Actor, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        self.keys.get(token).cloned().ok_or(AuthError::Invalid)
    }
}

/// Hex SHA-256 of a secret; used to derive stable ids without storing keys.
pub fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Clone, Debug)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_token(&parts.headers)
            .map(BearerToken)
            .ok_or(ApiError::Unauthorized)
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use sha2::{Digest, Sha256};

use crate::config::AuthSettings;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub admin: bool,
}

/// Bearer tokens known to the service, keyed by their hex SHA-256 digest.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    by_digest: HashMap<String, Principal>,
}

pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl TokenRegistry {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let by_digest = settings
            .tokens
            .iter()
            .map(|entry| {
                (
                    entry.sha256.trim().to_lowercase(),
                    Principal {
                        username: entry.username.clone(),
                        admin: entry.admin,
                    },
                )
            })
            .collect();
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }

    pub fn verify(&self, token: &str) -> Option<&Principal> {
        self.by_digest.get(&token_digest(token))
    }
}

/// Any caller holding a known token. Handlers scope every query to `username`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
}

/// A caller whose token carries the admin flag.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub username: String,
}

async fn principal(parts: &mut Parts, state: &Arc<AppState>) -> Result<Principal, AppError> {
    let TypedHeader(Authorization(bearer)) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::Unauthorized)?;

    state
        .auth
        .verify(bearer.token())
        .cloned()
        .ok_or(AppError::Unauthorized)
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let principal = principal(parts, state).await?;
        Ok(AuthUser {
            username: principal.username,
        })
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let principal = principal(parts, state).await?;
        if !principal.admin {
            tracing::warn!("Non-admin {} called an admin endpoint", principal.username);
            return Err(AppError::Forbidden);
        }
        Ok(AdminUser {
            username: principal.username,
        })
    }
}

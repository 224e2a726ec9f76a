//! Session validation.
//!
//! Session issuance lives in the external auth system, which writes rows to
//! the `sessions` table. This module only proves a presented token against
//! those rows: the raw token never touches the database, only its SHA-256
//! digest does.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::session;
use crate::errors::ServiceError;
use crate::AppState;

/// Cookie carrying the session token on storefront calls
pub const SESSION_COOKIE: &str = "msession";

pub const ROLE_CUSTOMER: &str = "customer";
pub const ROLE_OPERATOR: &str = "operator";

/// The proven identity behind a request
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

impl CurrentUser {
    pub fn is_operator(&self) -> bool {
        self.role == ROLE_OPERATOR
    }

    /// Store operators drive the order status machine; everyone else is read-only there.
    pub fn require_operator(&self) -> Result<(), ServiceError> {
        if self.is_operator() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "operator role required".to_string(),
            ))
        }
    }
}

/// Optional identity for endpoints that serve both users and guests
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<CurrentUser>);

/// Validates session tokens against the shared session store
#[derive(Clone)]
pub struct SessionService {
    db: Arc<DatabaseConnection>,
}

impl SessionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Hex-encoded SHA-256 digest of a session token
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[instrument(skip(self, token))]
    pub async fn validate(&self, token: &str) -> Result<CurrentUser, ServiceError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServiceError::AuthenticationRequired);
        }

        let token_hash = Self::hash_token(token);
        let row = session::Entity::find()
            .filter(session::Column::TokenHash.eq(token_hash))
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::AuthenticationRequired)?;

        if row.expires_at <= Utc::now() {
            return Err(ServiceError::AuthenticationRequired);
        }

        Ok(CurrentUser {
            session_id: row.id,
            user_id: row.user_id,
            role: row.role,
        })
    }
}

/// Pull the session token from `Authorization: Bearer` or the session cookie
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    let cookies = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(token) = pair.strip_prefix(SESSION_COOKIE) {
            if let Some(token) = token.strip_prefix('=') {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts).ok_or(ServiceError::AuthenticationRequired)?;
        state.services.sessions.validate(&token).await
    }
}

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = match extract_token(parts) {
            Some(token) => state.services.sessions.validate(&token).await.ok(),
            None => None,
        };
        Ok(MaybeUser(user))
    }
}

//! JWT authentication: Axum `FromRequestParts` extractor.
//!
//! Tokens come from `Authorization: Bearer <token>` or, for WebSocket
//! upgrades where browsers cannot set headers, the `?token=` query
//! parameter. Upgrade and REST handlers take `AuthUser` as an argument.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use parley_common::AppError;
use parley_protocol::ConnectionType;

/// Claims minted by the platform's auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Agent id, or visitor id for visitor tokens.
    pub sub: Uuid,
    pub tenant_id: Uuid,
    pub role: ConnectionType,
    /// Session a visitor token is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(sub: Uuid, tenant_id: Uuid, role: ConnectionType, ttl_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub,
            tenant_id,
            role,
            session_id: None,
            name: None,
            exp: now + ttl_secs,
            iat: now,
        }
    }

    pub fn sign(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }
}

/// Authenticated caller extractor.
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn tenant_id(&self) -> Uuid {
        self.0.tenant_id
    }

    pub fn role(&self) -> ConnectionType {
        self.0.role
    }

    pub fn require_role(&self, role: ConnectionType) -> Result<(), AppError> {
        if self.0.role == role {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("{role} token required")))
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Result<Option<String>, AppError> {
    let Some(header) = parts.headers.get("authorization") else {
        return Ok(None);
    };
    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid authorization header".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid authorization format".into()))?;
    Ok(Some(token.to_string()))
}

fn query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<std::sync::Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &std::sync::Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(parts)? {
            Some(token) => token,
            None => query_token(parts)
                .ok_or_else(|| AppError::Unauthorized("Missing access token".into()))?,
        };

        let token_data = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(state.config.auth.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| {
            tracing::debug!("JWT validation failed: {}", e);
            AppError::Unauthorized("Invalid or expired token".into())
        })?;

        Ok(AuthUser(token_data.claims))
    }
}

// =============================================================================
// AUTH MODULE
// =============================================================================
// Turns the bearer token of a request into a `Principal`.
//
// Tokens are issued by the upstream auth service; this service only verifies
// the HS256 signature and expiry, then reads the claims it needs:
//
//   { "sub": "<user id>", "email": "...", "role": "company_admin",
//     "companyId": "<uuid or null>", "exp": 1767225600 }
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderValue},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Role;
use crate::AppState;

/// Header used to carry the request correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

// -----------------------------------------------------------------------------
// CLAIMS & PRINCIPAL
// -----------------------------------------------------------------------------

/// Claims read from the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
    #[serde(rename = "companyId", default)]
    pub company_id: Option<Uuid>,
    pub exp: i64,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub company_id: Option<Uuid>,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
            company_id: claims.company_id,
        }
    }
}

/// Verify `token` and extract the principal.
pub fn decode_principal(token: &str, secret: &str) -> Result<Principal, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|err| {
            tracing::debug!(error = %err, "Bearer token rejected");
            AppError::Unauthorized("Invalid or expired token".into())
        })?;
    Ok(data.claims.into())
}

fn bearer_token(parts: &Parts) -> Result<&str, AppError> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| AppError::Unauthorized("Expected 'Bearer <token>'".into()))?;

    if token.is_empty() {
        return Err(AppError::Unauthorized("Empty bearer token".into()));
    }
    Ok(token)
}

// Using `Principal` as a handler argument makes the route require a valid token.
#[async_trait]
impl FromRequestParts<Arc<AppState>> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        decode_principal(token, &state.jwt_secret)
    }
}

// -----------------------------------------------------------------------------
// CORRELATION ID
// -----------------------------------------------------------------------------

/// Per-request correlation id.
///
/// Set by `middleware::correlation_id`; handlers take it as an argument and
/// attach it to the span of the work they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Read from a header value, generating a fresh id when absent or malformed.
    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        let id = value
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        Self(id)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<CorrelationId>() {
            return Ok(*id);
        }
        Ok(Self::from_header(parts.headers.get(CORRELATION_ID_HEADER)))
    }
}

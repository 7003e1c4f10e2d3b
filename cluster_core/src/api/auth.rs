//! Token authentication middleware.
//!
//! Callers present an identity token in `X-Auth-Token` or as
//! `Authorization: Bearer <token>`. The token is checked with the identity
//! service and handed to handlers as an [`Actor`] request extension; the
//! per-operation authorization happens in the lifecycle layer.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::error::ApiError;
use super::state::ApiState;
use crate::lifecycle::Actor;

pub const TOKEN_HEADER: &str = "X-Auth-Token";

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Whether a valid token is required (false = unauthenticated requests
    /// run as the service itself).
    pub required: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { required: true }
    }
}

impl AuthConfig {
    /// Create config with auth disabled (for testing).
    pub fn disabled() -> Self {
        Self { required: false }
    }
}

/// Token from `X-Auth-Token`, else from a bearer `Authorization` header.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let direct = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = direct {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolves the caller of a request.
pub async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Actor, ApiError> {
    match extract_token(headers) {
        Some(token) => {
            if state.auth_config.required {
                state
                    .identity
                    .validate_token(&token)
                    .await
                    .map_err(|e| ApiError::unauthorized(e.to_string()))?;
            }
            Ok(Actor::Token(token))
        }
        None if state.auth_config.required => Err(ApiError::unauthorized(format!(
            "missing {} or bearer token",
            TOKEN_HEADER
        ))),
        None => {
            debug!("No token presented, running request as the service");
            Ok(Actor::System)
        }
    }
}

/// Axum layer wrapper for the auth middleware.
pub async fn auth_layer(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

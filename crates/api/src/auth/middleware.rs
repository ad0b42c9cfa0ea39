//! Bearer-token middleware for Axum
//!
//! Each inbound surface has its own static credential. Comparison is
//! constant-time and tokens never reach the log.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Which credential a request was authenticated with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    LeadWebhook,
    Replacement,
    Admin,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::LeadWebhook => "lead_webhook",
            TokenScope::Replacement => "replacement",
            TokenScope::Admin => "admin",
        }
    }

    fn expected<'a>(&self, state: &'a AppState) -> &'a str {
        match self {
            TokenScope::LeadWebhook => &state.tokens.lead_webhook,
            TokenScope::Replacement => &state.tokens.replacement,
            TokenScope::Admin => &state.tokens.admin,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken => "Invalid or expired token",
        };
        let status = StatusCode::UNAUTHORIZED;

        let body = Json(json!({
            "error": message,
            "code": status.as_u16(),
            "reason": "unauthorized",
        }));

        (status, body).into_response()
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidAuthFormat)
}

/// Constant-time comparison; an unset expected token matches nothing
pub fn token_matches(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

fn authorize(state: &AppState, request: &Request, scope: TokenScope) -> Result<(), AuthError> {
    let provided = extract_bearer_token(request)?;
    if token_matches(provided, scope.expected(state)) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

async fn require_scope(
    state: AppState,
    scope: TokenScope,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match authorize(&state, &request, scope) {
        Ok(()) => {
            tracing::debug!(path = %path, scope = scope.as_str(), "Bearer token accepted");
            request.extensions_mut().insert(scope);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, scope = scope.as_str(), error = %err, "Bearer token rejected");
            err.into_response()
        }
    }
}

/// Lead-delivery webhook credential
pub async fn require_lead_webhook_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    require_scope(state, TokenScope::LeadWebhook, request, next).await
}

/// Contractor-facing replacement API credential
pub async fn require_replacement_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    require_scope(state, TokenScope::Replacement, request, next).await
}

/// Operator credential
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    require_scope(state, TokenScope::Admin, request, next).await
}

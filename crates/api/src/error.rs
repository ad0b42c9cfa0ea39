//! API error responses
//!
//! Clients get a generic message plus a machine-readable reason; the full
//! error goes to the log.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use leadgen_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    /// Field-level validation message, safe to show the caller
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Feature unavailable: {0}")]
    Unavailable(&'static str),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required".into(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "Not found".into()),
            ApiError::Unavailable(what) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                format!("{} is not available on this deployment", what),
            ),
            ApiError::Billing(err) => billing_parts(err),
        }
    }
}

fn billing_parts(err: &BillingError) -> (StatusCode, &'static str, String) {
    match err {
        BillingError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Authentication required".into(),
        ),
        BillingError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg.clone()),
        BillingError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            "not_found",
            "The referenced record was not found".into(),
        ),
        BillingError::MissingConfiguration(_) => (
            StatusCode::BAD_GATEWAY,
            "missing_configuration",
            "Billing is not configured for this account; retry once it is".into(),
        ),
        BillingError::Conflict(_) => (
            StatusCode::CONFLICT,
            "conflict",
            "The request conflicts with the current state".into(),
        ),
        BillingError::AmbiguousMatch(_) => (
            StatusCode::CONFLICT,
            "ambiguous_match",
            "The identifiers refer to different records; supply one".into(),
        ),
        BillingError::StripeApi(_) | BillingError::InvitationProvider(_) | BillingError::Email(_) => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "An upstream provider failed; please retry".into(),
        ),
        BillingError::WebhookSignatureInvalid => (
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "Invalid webhook signature".into(),
        ),
        BillingError::WebhookEventNotSupported(_) => (
            StatusCode::BAD_REQUEST,
            "unsupported_event",
            "Unsupported webhook event".into(),
        ),
        BillingError::Database(_) | BillingError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Something went wrong, please try again".into(),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = self.parts();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), reason, error = %self, "Request failed");
        } else {
            tracing::warn!(status = status.as_u16(), reason, error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": message,
            "code": status.as_u16(),
            "reason": reason,
        }));

        (status, body).into_response()
    }
}

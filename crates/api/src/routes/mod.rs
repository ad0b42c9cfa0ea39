//! API routes

mod admin;
mod health;
mod leads;
mod onboarding;
mod payments;
mod replacements;
#[cfg(test)]
mod route_tests;

use axum::{
    body::Bytes,
    middleware,
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;

use crate::{
    auth::{require_admin_token, require_lead_webhook_token, require_replacement_token},
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    let lead_webhook = Router::new()
        .route("/webhooks/lead-delivery", post(leads::record_delivery))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_lead_webhook_token,
        ));

    let replacement = Router::new()
        .route(
            "/api/replacement-requests",
            post(replacements::submit_replacement_request),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_replacement_token,
        ));

    let admin = Router::new()
        .route(
            "/api/admin/replacement-requests/{id}/resolve",
            post(admin::resolve_replacement_request),
        )
        .route(
            "/api/admin/lead-events/{id}/invalidate",
            post(admin::invalidate_lead_event),
        )
        .route("/api/admin/activations", post(admin::trigger_activation))
        .route(
            "/api/admin/organizations/{portal_key}/billing-model",
            post(admin::change_billing_model),
        )
        .route("/api/admin/invariants", get(admin::run_invariant_checks))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    // Public: signature-verified or token-scoped by URL
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/stripe", post(payments::stripe_webhook))
        .route("/api/leadgen/intents", post(onboarding::create_intent))
        .route("/api/leadgen/onboarding/{token}", get(onboarding::get_onboarding))
        .route(
            "/api/leadgen/onboarding/{token}/complete",
            post(onboarding::complete_onboarding),
        );

    Router::new()
        .merge(lead_webhook)
        .merge(replacement)
        .merge(admin)
        .merge(public)
        .with_state(state)
}

/// Parse a JSON body, reporting malformed input as a 400 with the field at fault
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("request body is required".into()));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

/// Parse a UUID path segment
pub(crate) fn parse_id(raw: &str) -> ApiResult<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid id: {}", raw)))
}

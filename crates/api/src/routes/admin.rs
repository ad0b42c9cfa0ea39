//! Operator routes
//!
//! Protected by the admin bearer token.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use leadgen_billing::{
    ActivationCandidate, ActivationOutcome, BillingModel, InvariantCheckSummary, InvariantChecker,
    LeadEvent, ManualActivation, Organization, ResolutionResult, ResolveReplacement,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    routes::{parse_id, parse_json},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateLeadRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBillingModelRequest {
    pub billing_model: BillingModel,
    /// Required once the organization has recorded leads
    #[serde(default)]
    pub migration: bool,
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    pub check: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum InvariantResponse {
    Summary(InvariantCheckSummary),
    Single {
        check: String,
        violations: Vec<leadgen_billing::InvariantViolation>,
    },
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn resolve_replacement_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ResolutionResult>> {
    let request_id = parse_id(&id)?;
    let resolution: ResolveReplacement = parse_json(&body)?;
    let result = state.billing.replacements.resolve(request_id, resolution).await?;
    Ok(Json(result))
}

pub async fn invalidate_lead_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<LeadEvent>> {
    let lead_event_id = parse_id(&id)?;
    let request: InvalidateLeadRequest = if body.is_empty() {
        InvalidateLeadRequest::default()
    } else {
        parse_json(&body)?
    };
    let actor = request.actor.unwrap_or_else(|| "admin".to_string());

    let event = state
        .billing
        .ledger
        .invalidate_lead_event(lead_event_id, &actor)
        .await?;
    Ok(Json(event))
}

/// Manually run activation for a customer, e.g. after an out-of-band payment
pub async fn trigger_activation(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ActivationOutcome>> {
    let manual: ManualActivation = parse_json(&body)?;
    let force = manual.force;
    tracing::info!(
        portal_key = ?manual.portal_key,
        force = force,
        "Manual activation requested"
    );

    let outcome = state
        .billing
        .activation
        .activate(ActivationCandidate::from(manual), force)
        .await?;
    Ok(Json(outcome))
}

pub async fn change_billing_model(
    State(state): State<AppState>,
    Path(portal_key): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Organization>> {
    let request: ChangeBillingModelRequest = parse_json(&body)?;
    let org = state
        .billing
        .organizations
        .change_billing_model(&portal_key, request.billing_model, request.migration)
        .await?;
    Ok(Json(org))
}

pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantResponse>> {
    let checker = state
        .invariants
        .as_ref()
        .ok_or(ApiError::Unavailable("Invariant checking"))?;

    match query.check {
        Some(check) => {
            if !InvariantChecker::available_checks().contains(&check.as_str()) {
                return Err(ApiError::BadRequest(format!("unknown invariant check: {}", check)));
            }
            let violations = checker.run_check(&check).await?;
            Ok(Json(InvariantResponse::Single { check, violations }))
        }
        None => Ok(Json(InvariantResponse::Summary(checker.run_all_checks().await?))),
    }
}

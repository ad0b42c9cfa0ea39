//! Checkout intents and token-scoped onboarding links

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use leadgen_billing::{BillingModel, CheckoutIntentRequest, IntentStatus, LeadgenIntent};
use serde::Serialize;
use uuid::Uuid;

use crate::{error::ApiResult, routes::parse_json, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub intent_id: Uuid,
    pub portal_key: String,
    pub company_name: String,
    pub billing_model: BillingModel,
    pub status: IntentStatus,
}

impl From<LeadgenIntent> for IntentResponse {
    fn from(intent: LeadgenIntent) -> Self {
        Self {
            intent_id: intent.id,
            portal_key: intent.portal_key,
            company_name: intent.company_name,
            billing_model: intent.billing_model,
            status: intent.status,
        }
    }
}

/// Start checkout; repeat calls for the same email and company reuse the intent
pub async fn create_intent(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<IntentResponse>> {
    let request: CheckoutIntentRequest = parse_json(&body)?;
    let intent = state.billing.intents.create_checkout_intent(request).await?;
    Ok(Json(intent.into()))
}

pub async fn get_onboarding(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<IntentResponse>> {
    let intent = state.billing.intents.find_by_token(&token).await?;
    Ok(Json(intent.into()))
}

pub async fn complete_onboarding(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<IntentResponse>> {
    let intent = state.billing.intents.complete_onboarding_by_token(&token).await?;
    Ok(Json(intent.into()))
}

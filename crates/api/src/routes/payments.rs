//! Stripe payment webhook

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use leadgen_billing::{BillingError, WebhookOutcome};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Billing(BillingError::WebhookSignatureInvalid))?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("webhook body is not valid UTF-8".into()))?;

    let outcome = state.billing.webhooks.handle(payload, signature).await?;
    Ok(Json(outcome))
}

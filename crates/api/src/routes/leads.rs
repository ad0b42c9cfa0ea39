//! Lead-delivery webhook

use axum::{body::Bytes, extract::State, Json};
use leadgen_shared::payload_fingerprint;
use serde_json::Value;

use crate::{error::ApiResult, routes::parse_json, state::AppState};

/// Record one delivered lead
///
/// A byte-identical body seen within the dedup TTL is answered from the cache
/// as a duplicate. Cache failures are logged and ignored; the ledger's own
/// keys decide either way.
pub async fn record_delivery(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let fingerprint = payload_fingerprint(&body);

    match state.dedup.get(&fingerprint).await {
        Ok(Some(cached)) => match serde_json::from_str::<Value>(&cached) {
            Ok(Value::Object(mut receipt)) => {
                receipt.insert("duplicate".into(), Value::Bool(true));
                tracing::info!(
                    fingerprint = %fingerprint,
                    portal_key = ?receipt.get("portalKey"),
                    "Duplicate delivery body answered from dedup cache"
                );
                return Ok(Json(Value::Object(receipt)));
            }
            _ => tracing::warn!(fingerprint = %fingerprint, "Unreadable dedup cache entry, ignoring"),
        },
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Dedup cache lookup failed, continuing"),
    }

    let payload: Value = parse_json(&body)?;
    let receipt = state.billing.ledger.record_delivery(&payload).await?;
    let response = serde_json::to_value(&receipt)
        .map_err(|e| leadgen_billing::BillingError::Internal(e.to_string()))?;

    if let Err(e) = state.dedup.put(&fingerprint, &response.to_string()).await {
        tracing::warn!(error = %e, "Failed to store delivery in dedup cache");
    }

    Ok(Json(response))
}

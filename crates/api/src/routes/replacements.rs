use axum::{body::Bytes, extract::State, Json};
use leadgen_billing::{ReplacementDecision, ReplacementSubmission};

use crate::{error::ApiResult, routes::parse_json, state::AppState};

/// Contractor dispute of a delivered lead
pub async fn submit_replacement_request(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ReplacementDecision>> {
    let submission: ReplacementSubmission = parse_json(&body)?;
    let decision = state.billing.replacements.submit(submission).await?;
    Ok(Json(decision))
}

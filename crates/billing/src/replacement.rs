//! Replacement request engine
//!
//! Contractors dispute delivered leads here. The policy decides at submission
//! time whether the request is auto-rejected or queued; a human resolves the
//! queued ones. Resolution is a single conditional update in the store, so a
//! second resolution of the same request reports `updated: false`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::models::{
    LeadEvent, PolicyChecks, ReplacementReason, ReplacementRequest, ReplacementStatus,
};
use crate::policy::{PolicyEvaluation, ReplacementPolicy};
use crate::store::{LedgerStore, NewReplacementRequest, ReplacementResolution};

/// Inbound dispute
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementSubmission {
    pub portal_key: String,
    pub lead_event_id: Option<Uuid>,
    pub source_external_id: Option<String>,
    pub reason: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub contact_attempted_at: Option<OffsetDateTime>,
    pub contact_attempt_method: Option<String>,
    pub evidence_notes: Option<String>,
    #[serde(default)]
    pub evidence_urls: Vec<String>,
    pub requested_by: Option<String>,
}

/// Response to a dispute submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementDecision {
    pub request_id: Uuid,
    pub status: ReplacementStatus,
    pub eligible_for_review: bool,
    pub policy: PolicyChecks,
    pub mandatory_review: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionDecision {
    Approve,
    Reject,
}

/// Operator decision on a queued request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveReplacement {
    pub decision: ResolutionDecision,
    pub resolved_by: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub updated: bool,
    pub request: ReplacementRequest,
    pub credits_restored: i64,
}

pub struct ReplacementRequestPolicyEngine {
    store: Arc<dyn LedgerStore>,
    policy: ReplacementPolicy,
    event_logger: BillingEventLogger,
}

impl ReplacementRequestPolicyEngine {
    pub fn new(store: Arc<dyn LedgerStore>, policy: ReplacementPolicy) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            store,
            policy,
            event_logger,
        }
    }

    pub fn policy(&self) -> &ReplacementPolicy {
        &self.policy
    }

    /// Find the disputed lead by id, by source id, or both
    ///
    /// Leads belonging to another portal key are reported as not found.
    /// When both identifiers are given they must name the same lead.
    async fn resolve_lead(&self, submission: &ReplacementSubmission) -> BillingResult<LeadEvent> {
        let source_id = submission
            .source_external_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let lead = match (submission.lead_event_id, source_id) {
            (None, None) => {
                return Err(BillingError::InvalidInput(
                    "leadEventId or sourceExternalId is required".into(),
                ))
            }
            (Some(id), _) => self
                .store
                .get_lead_event(id)
                .await?
                .filter(|lead| lead.portal_key == submission.portal_key)
                .ok_or_else(|| BillingError::NotFound(format!("lead event {}", id)))?,
            (None, Some(source_id)) => self
                .store
                .find_lead_event_by_source(&submission.portal_key, source_id)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("lead with source id {}", source_id))
                })?,
        };

        if let Some(source_id) = source_id {
            if lead.source_external_id != source_id {
                return Err(BillingError::AmbiguousMatch(format!(
                    "leadEventId {} has source id {}, not {}",
                    lead.id, lead.source_external_id, source_id
                )));
            }
        }
        Ok(lead)
    }

    /// Evaluate and store a dispute
    pub async fn submit(&self, submission: ReplacementSubmission) -> BillingResult<ReplacementDecision> {
        let reason: ReplacementReason = submission.reason.trim().parse()?;
        let lead = self.resolve_lead(&submission).await?;
        let requested_at = OffsetDateTime::now_utc();
        let already_disputed = self.store.has_open_replacement_request(lead.id).await?;

        let evaluation = self.policy.evaluate(
            &lead,
            already_disputed,
            reason,
            requested_at,
            submission.contact_attempted_at,
        );

        let request = self
            .store
            .insert_replacement_request(NewReplacementRequest {
                portal_key: lead.portal_key.clone(),
                lead_event_id: lead.id,
                requested_at,
                reason,
                contact_attempted_at: submission.contact_attempted_at,
                contact_attempt_method: submission.contact_attempt_method,
                evidence_notes: submission.evidence_notes,
                evidence_urls: submission.evidence_urls,
                requested_by: submission.requested_by,
                policy: evaluation.checks,
                mandatory_review: evaluation.mandatory_review,
                status: evaluation.status,
            })
            .await?;

        // A concurrent submission for the same lead may have won the race
        let evaluation = PolicyEvaluation {
            checks: request.policy,
            mandatory_review: request.mandatory_review,
            status: request.status,
        };

        tracing::info!(
            portal_key = %request.portal_key,
            request_id = %request.id,
            lead_event_id = %lead.id,
            reason = %reason,
            status = %request.status,
            failed_checks = ?evaluation.checks.failed_checks(),
            mandatory_review = evaluation.mandatory_review,
            "Replacement request evaluated"
        );

        let event_type = if evaluation.eligible_for_review() {
            BillingEventType::ReplacementSubmitted
        } else {
            BillingEventType::ReplacementAutoRejected
        };
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(&request.portal_key, event_type)
                    .lead_event(lead.id)
                    .data(serde_json::json!({
                        "replacement_request_id": request.id,
                        "reason": reason.as_str(),
                        "policy": evaluation.checks,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log replacement submission event");
        }

        Ok(ReplacementDecision {
            request_id: request.id,
            status: request.status,
            eligible_for_review: evaluation.eligible_for_review(),
            policy: evaluation.checks,
            mandatory_review: evaluation.mandatory_review,
            message: evaluation.message(),
        })
    }

    /// Approve or reject a queued request
    pub async fn resolve(
        &self,
        request_id: Uuid,
        resolution: ResolveReplacement,
    ) -> BillingResult<ResolutionResult> {
        if resolution.resolved_by.trim().is_empty() {
            return Err(BillingError::InvalidInput("resolvedBy is required".into()));
        }

        let outcome = self
            .store
            .resolve_replacement_request(ReplacementResolution {
                request_id,
                approve: resolution.decision == ResolutionDecision::Approve,
                resolved_by: resolution.resolved_by,
                notes: resolution.notes,
                resolved_at: OffsetDateTime::now_utc(),
            })
            .await?;

        if outcome.updated {
            tracing::info!(
                portal_key = %outcome.request.portal_key,
                request_id = %request_id,
                status = %outcome.request.status,
                credits_restored = outcome.credits_restored,
                "Replacement request resolved"
            );
        } else {
            tracing::info!(
                request_id = %request_id,
                status = %outcome.request.status,
                "Replacement request already resolved"
            );
        }

        Ok(ResolutionResult {
            updated: outcome.updated,
            request: outcome.request,
            credits_restored: outcome.credits_restored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingModel, ContactInfo, LeadEventStatus, StripeIds};
    use crate::store::{MemoryLedgerStore, NewLeadEvent, NewOrganization};
    use time::Duration;

    async fn setup(
        model: BillingModel,
        credits: i64,
        delivered_at: OffsetDateTime,
    ) -> (ReplacementRequestPolicyEngine, Arc<MemoryLedgerStore>, LeadEvent) {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .seed_organization(NewOrganization {
                portal_key: "bob-hvac".into(),
                company_name: "Bob HVAC".into(),
                billing_model: model,
                prepaid_lead_credits: credits,
                lead_commitment_total: 40,
                lead_charge_threshold: 1,
                lead_unit_price_cents: 4500,
                stripe: StripeIds::default(),
            })
            .await;
        let lead = store
            .record_lead_event(NewLeadEvent {
                portal_key: "bob-hvac".into(),
                idempotency_key: "d-1".into(),
                source_external_id: "lead-1".into(),
                delivered_at,
                quantity: 1,
                contact: ContactInfo::default(),
            })
            .await
            .unwrap()
            .event;
        let engine = ReplacementRequestPolicyEngine::new(store.clone(), ReplacementPolicy::default());
        (engine, store, lead)
    }

    fn submission(lead_event_id: Option<Uuid>, source: Option<&str>, reason: &str) -> ReplacementSubmission {
        ReplacementSubmission {
            portal_key: "bob-hvac".into(),
            lead_event_id,
            source_external_id: source.map(str::to_string),
            reason: reason.into(),
            contact_attempted_at: None,
            contact_attempt_method: None,
            evidence_notes: None,
            evidence_urls: Vec::new(),
            requested_by: Some("bob@hvac.test".into()),
        }
    }

    fn approve() -> ResolveReplacement {
        ResolveReplacement {
            decision: ResolutionDecision::Approve,
            resolved_by: "ops@leadgen.test".into(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_reason_is_validation_error() {
        let (engine, _, lead) =
            setup(BillingModel::PayPerLeadPerpetual, 0, OffsetDateTime::now_utc()).await;
        let err = engine
            .submit(submission(Some(lead.id), None, "bad_vibes"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_mismatched_identifiers_are_ambiguous() {
        let (engine, _, lead) =
            setup(BillingModel::PayPerLeadPerpetual, 0, OffsetDateTime::now_utc()).await;
        let err = engine
            .submit(submission(Some(lead.id), Some("lead-999"), "wrong_number"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AmbiguousMatch(_)));
    }

    #[tokio::test]
    async fn test_other_tenant_lead_is_not_found() {
        let (engine, _, lead) =
            setup(BillingModel::PayPerLeadPerpetual, 0, OffsetDateTime::now_utc()).await;
        let mut foreign = submission(Some(lead.id), None, "wrong_number");
        foreign.portal_key = "acme-roofing".into();
        assert!(matches!(
            engine.submit(foreign).await.unwrap_err(),
            BillingError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_approval_restores_prepaid_credit() {
        let (engine, store, lead) =
            setup(BillingModel::Package40PaidInFull, 1, OffsetDateTime::now_utc()).await;
        assert_eq!(
            store.get_organization("bob-hvac").await.unwrap().unwrap().prepaid_lead_credits,
            0
        );

        let decision = engine
            .submit(submission(None, Some("lead-1"), "wrong_number"))
            .await
            .unwrap();
        assert_eq!(decision.status, ReplacementStatus::Submitted);
        assert!(decision.eligible_for_review);

        let result = engine.resolve(decision.request_id, approve()).await.unwrap();
        assert!(result.updated);
        assert_eq!(result.request.status, ReplacementStatus::Approved);
        assert_eq!(result.credits_restored, 1);

        let org = store.get_organization("bob-hvac").await.unwrap().unwrap();
        assert_eq!(org.prepaid_lead_credits, 1);
        let lead = store.get_lead_event(lead.id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadEventStatus::Credited);
    }

    #[tokio::test]
    async fn test_approval_of_billed_lead_records_refund_equivalent() {
        let (engine, store, _lead) =
            setup(BillingModel::PayPerLeadPerpetual, 0, OffsetDateTime::now_utc()).await;
        let decision = engine
            .submit(submission(None, Some("lead-1"), "spam_or_fake"))
            .await
            .unwrap();
        engine.resolve(decision.request_id, approve()).await.unwrap();

        let credit = store
            .list_billing_events("bob-hvac")
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.event_type == "lead_replacement_credit")
            .unwrap();
        assert_eq!(credit.amount_cents, Some(4500));
    }

    #[tokio::test]
    async fn test_auto_rejected_request_cannot_be_resolved() {
        let delivered = OffsetDateTime::now_utc() - Duration::days(10);
        let (engine, store, lead) = setup(BillingModel::PayPerLeadPerpetual, 0, delivered).await;
        let decision = engine
            .submit(submission(Some(lead.id), None, "wrong_number"))
            .await
            .unwrap();
        assert_eq!(decision.status, ReplacementStatus::AutoRejectedPolicy);
        assert!(!decision.policy.within_one_week);

        let result = engine.resolve(decision.request_id, approve()).await.unwrap();
        assert!(!result.updated);
        assert_eq!(result.request.status, ReplacementStatus::AutoRejectedPolicy);
        let lead = store.get_lead_event(lead.id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadEventStatus::Delivered);
    }

    #[tokio::test]
    async fn test_submission_deserializes_from_wire_shape() {
        let submission: ReplacementSubmission = serde_json::from_value(serde_json::json!({
            "portalKey": "bob-hvac",
            "sourceExternalId": "lead-1",
            "reason": "never_answered",
            "contactAttemptedAt": "2026-03-01T09:05:00Z",
            "evidenceUrls": ["https://example.com/call-log.png"]
        }))
        .unwrap();
        assert_eq!(submission.source_external_id.as_deref(), Some("lead-1"));
        assert!(submission.contact_attempted_at.is_some());
        assert_eq!(submission.evidence_urls.len(), 1);
        assert!(submission.lead_event_id.is_none());
    }
}

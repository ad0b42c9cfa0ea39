//! In-memory ledger store
//!
//! All state sits behind a single async mutex, so each trait method is one
//! critical section with the same all-or-nothing behavior as a Postgres
//! transaction. Used by tests and single-process local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    InvitationRecord, LedgerStore, NewBillingEvent, NewIntent, NewLeadEvent, NewOrganization,
    NewReplacementRequest, RecordedLeadEvent, ReplacementResolution, ResolutionOutcome,
};
use crate::billable::{decide_billable, LedgerPosition};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType};
use crate::models::{
    BillingCustomer, BillingEvent, BillingModel, IntentStatus, LeadEvent, LeadEventStatus,
    LeadgenIntent, Organization, ReplacementRequest, ReplacementStatus, StripeIds,
};

const STALE_CLAIM_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
struct WebhookClaim {
    result: String,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    organizations: HashMap<String, Organization>,
    intents: Vec<LeadgenIntent>,
    lead_events: Vec<LeadEvent>,
    replacements: Vec<ReplacementRequest>,
    billing_events: Vec<BillingEvent>,
    customers: Vec<BillingCustomer>,
    webhook_claims: HashMap<String, WebhookClaim>,
}

impl MemoryState {
    fn push_billing_event(&mut self, event: NewBillingEvent) -> BillingEvent {
        let event = BillingEvent {
            id: Uuid::new_v4(),
            portal_key: event.portal_key,
            event_type: event.event_type,
            amount_cents: event.amount_cents,
            lead_event_id: event.lead_event_id,
            stripe_reference: event.stripe_reference,
            data: event.data,
            created_at: OffsetDateTime::now_utc(),
        };
        self.billing_events.push(event.clone());
        event
    }

    fn has_open_replacement(&self, lead_event_id: Uuid) -> bool {
        self.replacements.iter().any(|r| {
            r.lead_event_id == lead_event_id
                && matches!(
                    r.status,
                    ReplacementStatus::Submitted | ReplacementStatus::Approved
                )
        })
    }
}

/// Ledger store backed by process memory
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an organization directly, bypassing the intent flow
    pub async fn seed_organization(&self, org: NewOrganization) -> Organization {
        let organization = organization_from(org);
        self.state
            .lock()
            .await
            .organizations
            .insert(organization.portal_key.clone(), organization.clone());
        organization
    }

    /// Number of recorded lead events, for assertions
    pub async fn lead_event_count(&self) -> usize {
        self.state.lock().await.lead_events.len()
    }
}

fn organization_from(org: NewOrganization) -> Organization {
    let now = OffsetDateTime::now_utc();
    Organization {
        id: Uuid::new_v4(),
        portal_key: org.portal_key,
        company_name: org.company_name,
        billing_model: org.billing_model,
        prepaid_lead_credits: org.prepaid_lead_credits.max(0),
        lead_commitment_total: org.lead_commitment_total.max(0),
        lead_charge_threshold: org.lead_charge_threshold,
        lead_unit_price_cents: org.lead_unit_price_cents,
        stripe_customer_id: org.stripe.customer_id,
        stripe_subscription_id: org.stripe.subscription_id,
        stripe_subscription_item_id: org.stripe.subscription_item_id,
        active: true,
        onboarding_status: "pending".to_string(),
        created_at: now,
        updated_at: now,
    }
}

fn fill_missing(slot: &mut Option<String>, value: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_organization(&self, portal_key: &str) -> BillingResult<Option<Organization>> {
        Ok(self.state.lock().await.organizations.get(portal_key).cloned())
    }

    async fn create_organization_if_absent(
        &self,
        org: NewOrganization,
    ) -> BillingResult<(Organization, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.organizations.get(&org.portal_key) {
            return Ok((existing.clone(), false));
        }
        let organization = organization_from(org);
        state
            .organizations
            .insert(organization.portal_key.clone(), organization.clone());
        Ok((organization, true))
    }

    async fn attach_stripe_ids(
        &self,
        portal_key: &str,
        ids: &StripeIds,
    ) -> BillingResult<Organization> {
        let mut state = self.state.lock().await;
        let org = state
            .organizations
            .get_mut(portal_key)
            .ok_or_else(|| BillingError::NotFound(format!("organization {}", portal_key)))?;
        fill_missing(&mut org.stripe_customer_id, &ids.customer_id);
        fill_missing(&mut org.stripe_subscription_id, &ids.subscription_id);
        fill_missing(&mut org.stripe_subscription_item_id, &ids.subscription_item_id);
        org.updated_at = OffsetDateTime::now_utc();
        Ok(org.clone())
    }

    async fn change_billing_model(
        &self,
        portal_key: &str,
        model: BillingModel,
        migration: bool,
    ) -> BillingResult<Organization> {
        let mut state = self.state.lock().await;
        let lead_count = state
            .lead_events
            .iter()
            .filter(|e| e.portal_key == portal_key)
            .count();
        let org = state
            .organizations
            .get_mut(portal_key)
            .ok_or_else(|| BillingError::NotFound(format!("organization {}", portal_key)))?;

        if org.billing_model == model {
            return Ok(org.clone());
        }
        if lead_count > 0 && !migration {
            return Err(BillingError::Conflict(format!(
                "organization {} has {} lead events billed under {}",
                portal_key, lead_count, org.billing_model
            )));
        }

        let from = org.billing_model;
        let defaults = model.defaults();
        org.billing_model = model;
        org.lead_commitment_total = defaults.lead_commitment_total;
        if lead_count == 0 {
            org.prepaid_lead_credits = defaults.prepaid_lead_credits;
        }
        org.updated_at = OffsetDateTime::now_utc();
        let updated = org.clone();

        state.push_billing_event(
            BillingEventBuilder::new(portal_key, BillingEventType::BillingModelChanged)
                .data(serde_json::json!({
                    "from": from.as_str(),
                    "to": model.as_str(),
                    "migration": migration,
                    "lead_events": lead_count,
                }))
                .build(),
        );
        Ok(updated)
    }

    async fn insert_intent(&self, intent: NewIntent) -> BillingResult<LeadgenIntent> {
        let mut state = self.state.lock().await;
        if state.intents.iter().any(|i| i.token == intent.token) {
            return Err(BillingError::Conflict("intent token already issued".into()));
        }
        let paid_at = (intent.status >= IntentStatus::Paid).then_some(intent.created_at);
        let invited_at = (intent.status >= IntentStatus::Invited).then_some(intent.created_at);
        let completed_at =
            (intent.status >= IntentStatus::OnboardingCompleted).then_some(intent.created_at);
        let record = LeadgenIntent {
            id: Uuid::new_v4(),
            portal_key: intent.portal_key,
            company_name: intent.company_name,
            billing_email: intent.billing_email,
            billing_model: intent.billing_model,
            token: intent.token,
            token_expires_at: intent.token_expires_at,
            status: intent.status,
            source: intent.source,
            paid_at,
            invited_at,
            onboarding_completed_at: completed_at,
            created_at: intent.created_at,
            updated_at: intent.created_at,
        };
        state.intents.push(record.clone());
        Ok(record)
    }

    async fn find_intent_by_token(&self, token: &str) -> BillingResult<Option<LeadgenIntent>> {
        let state = self.state.lock().await;
        Ok(state.intents.iter().find(|i| i.token == token).cloned())
    }

    async fn find_intent_by_portal_key(
        &self,
        portal_key: &str,
    ) -> BillingResult<Option<LeadgenIntent>> {
        let state = self.state.lock().await;
        Ok(state
            .intents
            .iter()
            .filter(|i| i.portal_key == portal_key)
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn find_active_intent(
        &self,
        billing_email: &str,
        company_name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<LeadgenIntent>> {
        let state = self.state.lock().await;
        Ok(state
            .intents
            .iter()
            .filter(|i| {
                i.billing_email.eq_ignore_ascii_case(billing_email)
                    && i.company_name.eq_ignore_ascii_case(company_name)
                    && i.is_active(now)
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn advance_intent(
        &self,
        intent_id: Uuid,
        target: IntentStatus,
        at: OffsetDateTime,
        token_expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<LeadgenIntent> {
        let mut state = self.state.lock().await;
        let intent = state
            .intents
            .iter_mut()
            .find(|i| i.id == intent_id)
            .ok_or_else(|| BillingError::NotFound(format!("leadgen intent {}", intent_id)))?;

        if intent.status >= target {
            return Ok(intent.clone());
        }
        if target >= IntentStatus::Paid && intent.paid_at.is_none() {
            intent.paid_at = Some(at);
        }
        if target >= IntentStatus::Invited && intent.invited_at.is_none() {
            intent.invited_at = Some(at);
        }
        if target >= IntentStatus::OnboardingCompleted && intent.onboarding_completed_at.is_none() {
            intent.onboarding_completed_at = Some(at);
        }
        if let Some(expires_at) = token_expires_at {
            intent.token_expires_at = expires_at;
        }
        intent.status = target;
        intent.updated_at = at;
        Ok(intent.clone())
    }

    async fn record_lead_event(&self, event: NewLeadEvent) -> BillingResult<RecordedLeadEvent> {
        if event.quantity < 1 {
            return Err(BillingError::InvalidInput(
                "quantity must be at least 1".into(),
            ));
        }
        let mut state = self.state.lock().await;

        if !state.organizations.contains_key(&event.portal_key) {
            return Err(BillingError::NotFound(format!(
                "organization {}",
                event.portal_key
            )));
        }

        if let Some(existing) = state.lead_events.iter().find(|e| {
            e.portal_key == event.portal_key
                && (e.idempotency_key == event.idempotency_key
                    || e.source_external_id == event.source_external_id)
        }) {
            return Ok(RecordedLeadEvent {
                event: existing.clone(),
                duplicate: true,
            });
        }

        let (prior_deliveries, covered_units) = state
            .lead_events
            .iter()
            .filter(|e| e.portal_key == event.portal_key)
            .fold((0i64, 0i64), |(count, covered), e| {
                let free = if e.status == LeadEventStatus::Credited {
                    0
                } else {
                    e.quantity - e.billable_quantity
                };
                (count + 1, covered + free)
            });

        let now = OffsetDateTime::now_utc();
        let org = state
            .organizations
            .get_mut(&event.portal_key)
            .ok_or_else(|| BillingError::NotFound(format!("organization {}", event.portal_key)))?;
        let decision = decide_billable(
            org.billing_model,
            LedgerPosition {
                prepaid_credits: org.prepaid_lead_credits,
                commitment_total: org.lead_commitment_total,
                covered_units,
                prior_deliveries,
            },
            event.quantity,
        );
        org.prepaid_lead_credits -= decision.credits_consumed;
        org.updated_at = now;

        let record = LeadEvent {
            id: Uuid::new_v4(),
            portal_key: event.portal_key,
            idempotency_key: event.idempotency_key,
            source_external_id: event.source_external_id,
            delivered_at: event.delivered_at,
            quantity: event.quantity,
            status: LeadEventStatus::Delivered,
            billable_quantity: decision.billable_quantity,
            credits_consumed: decision.credits_consumed,
            billing_skipped_reason: decision.skipped_reason.map(str::to_string),
            stripe_usage_record_id: None,
            usage_recorded_at: None,
            contact: event.contact,
            created_at: now,
        };
        state.lead_events.push(record.clone());
        Ok(RecordedLeadEvent {
            event: record,
            duplicate: false,
        })
    }

    async fn get_lead_event(&self, id: Uuid) -> BillingResult<Option<LeadEvent>> {
        let state = self.state.lock().await;
        Ok(state.lead_events.iter().find(|e| e.id == id).cloned())
    }

    async fn find_lead_event_by_source(
        &self,
        portal_key: &str,
        source_external_id: &str,
    ) -> BillingResult<Option<LeadEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .lead_events
            .iter()
            .find(|e| e.portal_key == portal_key && e.source_external_id == source_external_id)
            .cloned())
    }

    async fn set_usage_record_id(
        &self,
        lead_event_id: Uuid,
        usage_record_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let event = state
            .lead_events
            .iter_mut()
            .find(|e| e.id == lead_event_id)
            .ok_or_else(|| BillingError::NotFound(format!("lead event {}", lead_event_id)))?;
        if event.stripe_usage_record_id.is_some() {
            return Ok(false);
        }
        event.stripe_usage_record_id = Some(usage_record_id.to_string());
        event.usage_recorded_at = Some(at);
        Ok(true)
    }

    async fn invalidate_lead_event(&self, lead_event_id: Uuid) -> BillingResult<LeadEvent> {
        let mut state = self.state.lock().await;
        let event = state
            .lead_events
            .iter_mut()
            .find(|e| e.id == lead_event_id)
            .ok_or_else(|| BillingError::NotFound(format!("lead event {}", lead_event_id)))?;
        if !event.status.can_transition_to(LeadEventStatus::Invalid) {
            return Err(BillingError::Conflict(format!(
                "lead event {} is {}",
                lead_event_id, event.status
            )));
        }
        event.status = LeadEventStatus::Invalid;
        Ok(event.clone())
    }

    async fn list_unreported_usage(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<LeadEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<LeadEvent> = state
            .lead_events
            .iter()
            .filter(|e| {
                e.status == LeadEventStatus::Delivered
                    && e.billable_quantity > 0
                    && e.stripe_usage_record_id.is_none()
                    && e.created_at < older_than
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(events)
    }

    async fn has_open_replacement_request(&self, lead_event_id: Uuid) -> BillingResult<bool> {
        let state = self.state.lock().await;
        Ok(state.has_open_replacement(lead_event_id))
    }

    async fn insert_replacement_request(
        &self,
        mut request: NewReplacementRequest,
    ) -> BillingResult<ReplacementRequest> {
        let mut state = self.state.lock().await;
        if !state.lead_events.iter().any(|e| e.id == request.lead_event_id) {
            return Err(BillingError::NotFound(format!(
                "lead event {}",
                request.lead_event_id
            )));
        }
        if request.status == ReplacementStatus::Submitted
            && state.has_open_replacement(request.lead_event_id)
        {
            request.policy.lead_status_eligible = false;
            request.status = ReplacementStatus::AutoRejectedPolicy;
        }
        let record = ReplacementRequest {
            id: Uuid::new_v4(),
            portal_key: request.portal_key,
            lead_event_id: request.lead_event_id,
            requested_at: request.requested_at,
            reason: request.reason,
            contact_attempted_at: request.contact_attempted_at,
            contact_attempt_method: request.contact_attempt_method,
            evidence_notes: request.evidence_notes,
            evidence_urls: request.evidence_urls,
            requested_by: request.requested_by,
            policy: request.policy,
            mandatory_review: request.mandatory_review,
            status: request.status,
            resolved_by: None,
            resolution_notes: None,
            resolved_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.replacements.push(record.clone());
        Ok(record)
    }

    async fn get_replacement_request(&self, id: Uuid) -> BillingResult<Option<ReplacementRequest>> {
        let state = self.state.lock().await;
        Ok(state.replacements.iter().find(|r| r.id == id).cloned())
    }

    async fn resolve_replacement_request(
        &self,
        resolution: ReplacementResolution,
    ) -> BillingResult<ResolutionOutcome> {
        let mut state = self.state.lock().await;
        let request_idx = state
            .replacements
            .iter()
            .position(|r| r.id == resolution.request_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("replacement request {}", resolution.request_id))
            })?;

        if state.replacements[request_idx].status != ReplacementStatus::Submitted {
            return Ok(ResolutionOutcome {
                updated: false,
                request: state.replacements[request_idx].clone(),
                credits_restored: 0,
            });
        }

        let lead_event_id = state.replacements[request_idx].lead_event_id;
        let portal_key = state.replacements[request_idx].portal_key.clone();
        let mut credits_restored = 0;

        if resolution.approve {
            // Validate everything before mutating anything
            let event_idx = state
                .lead_events
                .iter()
                .position(|e| e.id == lead_event_id)
                .ok_or_else(|| BillingError::NotFound(format!("lead event {}", lead_event_id)))?;
            let event = &state.lead_events[event_idx];
            if !event.status.can_transition_to(LeadEventStatus::Credited) {
                return Err(BillingError::Conflict(format!(
                    "lead event {} is {}",
                    lead_event_id, event.status
                )));
            }
            let credits_consumed = event.credits_consumed;
            let billable_quantity = event.billable_quantity;
            let unit_price = state
                .organizations
                .get(&portal_key)
                .map(|o| o.lead_unit_price_cents)
                .ok_or_else(|| BillingError::NotFound(format!("organization {}", portal_key)))?;

            state.lead_events[event_idx].status = LeadEventStatus::Credited;
            if let Some(org) = state.organizations.get_mut(&portal_key) {
                org.prepaid_lead_credits += credits_consumed;
                org.updated_at = resolution.resolved_at;
            }
            credits_restored = credits_consumed;

            if billable_quantity > 0 {
                state.push_billing_event(
                    BillingEventBuilder::new(&portal_key, BillingEventType::LeadReplacementCredit)
                        .amount_cents(billable_quantity * unit_price)
                        .lead_event(lead_event_id)
                        .data(serde_json::json!({
                            "replacement_request_id": resolution.request_id,
                            "billable_quantity": billable_quantity,
                        }))
                        .build(),
                );
            }
        }

        let request = &mut state.replacements[request_idx];
        request.status = if resolution.approve {
            ReplacementStatus::Approved
        } else {
            ReplacementStatus::Rejected
        };
        request.resolved_by = Some(resolution.resolved_by.clone());
        request.resolution_notes = resolution.notes.clone();
        request.resolved_at = Some(resolution.resolved_at);
        let request = request.clone();

        let event_type = if resolution.approve {
            BillingEventType::ReplacementApproved
        } else {
            BillingEventType::ReplacementRejected
        };
        state.push_billing_event(
            BillingEventBuilder::new(&portal_key, event_type)
                .lead_event(lead_event_id)
                .data(serde_json::json!({
                    "replacement_request_id": resolution.request_id,
                    "reason": request.reason.as_str(),
                    "resolved_by": resolution.resolved_by,
                    "credits_restored": credits_restored,
                }))
                .build(),
        );

        Ok(ResolutionOutcome {
            updated: true,
            request,
            credits_restored,
        })
    }

    async fn append_billing_event(&self, event: NewBillingEvent) -> BillingResult<BillingEvent> {
        Ok(self.state.lock().await.push_billing_event(event))
    }

    async fn list_billing_events(&self, portal_key: &str) -> BillingResult<Vec<BillingEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .billing_events
            .iter()
            .filter(|e| e.portal_key == portal_key)
            .cloned()
            .collect())
    }

    async fn find_billing_customer(&self, email: &str) -> BillingResult<Option<BillingCustomer>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .iter()
            .find(|c| c.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn record_invitation(&self, record: InvitationRecord) -> BillingResult<BillingCustomer> {
        let mut state = self.state.lock().await;
        if let Some(customer) = state
            .customers
            .iter_mut()
            .find(|c| c.email.eq_ignore_ascii_case(&record.email))
        {
            customer.portal_key = record.portal_key;
            if record.stripe_customer_id.is_some() {
                customer.stripe_customer_id = record.stripe_customer_id;
            }
            customer.invitation_id = Some(record.invitation_id);
            customer.invitation_sent_at = Some(record.sent_at);
            return Ok(customer.clone());
        }
        let customer = BillingCustomer {
            id: Uuid::new_v4(),
            portal_key: record.portal_key,
            email: record.email,
            stripe_customer_id: record.stripe_customer_id,
            invitation_id: Some(record.invitation_id),
            invitation_sent_at: Some(record.sent_at),
        };
        state.customers.push(customer.clone());
        Ok(customer)
    }

    async fn claim_webhook_event(
        &self,
        stripe_event_id: &str,
        _event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        match state.webhook_claims.get_mut(stripe_event_id) {
            None => {
                state.webhook_claims.insert(
                    stripe_event_id.to_string(),
                    WebhookClaim {
                        result: "processing".into(),
                        started_at: now,
                        error_message: None,
                    },
                );
                Ok(true)
            }
            Some(claim) => {
                let stale = claim.result == "processing"
                    && claim.started_at < now - Duration::minutes(STALE_CLAIM_MINUTES);
                if stale || claim.result == "error" {
                    claim.result = "processing".into();
                    claim.started_at = now;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn finish_webhook_event(
        &self,
        stripe_event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(claim) = state.webhook_claims.get_mut(stripe_event_id) {
            claim.result = result.to_string();
            claim.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContactInfo, PolicyChecks, ReplacementReason};

    fn org(portal_key: &str, model: BillingModel, credits: i64) -> NewOrganization {
        NewOrganization {
            portal_key: portal_key.to_string(),
            company_name: portal_key.to_string(),
            billing_model: model,
            prepaid_lead_credits: credits,
            lead_commitment_total: model.defaults().lead_commitment_total,
            lead_charge_threshold: 1,
            lead_unit_price_cents: 4500,
            stripe: StripeIds::default(),
        }
    }

    fn delivery(portal_key: &str, key: &str, source: &str) -> NewLeadEvent {
        NewLeadEvent {
            portal_key: portal_key.to_string(),
            idempotency_key: key.to_string(),
            source_external_id: source.to_string(),
            delivered_at: OffsetDateTime::now_utc(),
            quantity: 1,
            contact: ContactInfo::default(),
        }
    }

    #[tokio::test]
    async fn test_record_requires_known_organization() {
        let store = MemoryLedgerStore::new();
        let err = store
            .record_lead_event(delivery("ghost", "k1", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_matches_either_key_and_keeps_credits() {
        let store = MemoryLedgerStore::new();
        store
            .seed_organization(org("bob-hvac", BillingModel::Package40PaidInFull, 3))
            .await;

        let first = store
            .record_lead_event(delivery("bob-hvac", "k1", "s1"))
            .await
            .unwrap();
        let by_source = store
            .record_lead_event(delivery("bob-hvac", "k2", "s1"))
            .await
            .unwrap();
        let by_key = store
            .record_lead_event(delivery("bob-hvac", "k1", "s2"))
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(by_source.duplicate && by_key.duplicate);
        assert_eq!(by_source.event.id, first.event.id);
        assert_eq!(by_key.event.id, first.event.id);
        let org = store.get_organization("bob-hvac").await.unwrap().unwrap();
        assert_eq!(org.prepaid_lead_credits, 2);
        assert_eq!(store.lead_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_same_keys_under_other_portal_are_distinct() {
        let store = MemoryLedgerStore::new();
        store
            .seed_organization(org("a", BillingModel::PayPerLeadPerpetual, 0))
            .await;
        store
            .seed_organization(org("b", BillingModel::PayPerLeadPerpetual, 0))
            .await;
        let a = store.record_lead_event(delivery("a", "k", "s")).await.unwrap();
        let b = store.record_lead_event(delivery("b", "k", "s")).await.unwrap();
        assert!(!a.duplicate && !b.duplicate);
        assert_ne!(a.event.id, b.event.id);
    }

    #[tokio::test]
    async fn test_change_billing_model_requires_migration_once_billed() {
        let store = MemoryLedgerStore::new();
        store
            .seed_organization(org("acme", BillingModel::PayPerLeadPerpetual, 0))
            .await;

        let switched = store
            .change_billing_model("acme", BillingModel::Package40PaidInFull, false)
            .await
            .unwrap();
        assert_eq!(switched.prepaid_lead_credits, 40);

        store.record_lead_event(delivery("acme", "k", "s")).await.unwrap();
        let err = store
            .change_billing_model("acme", BillingModel::PayPerLeadPerpetual, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        let migrated = store
            .change_billing_model("acme", BillingModel::PayPerLeadPerpetual, true)
            .await
            .unwrap();
        assert_eq!(migrated.billing_model, BillingModel::PayPerLeadPerpetual);
        assert_eq!(migrated.prepaid_lead_credits, 39);

        let events = store.list_billing_events("acme").await.unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == "billing_model_changed")
                .count(),
            2
        );
    }

    fn passing_request(lead_event_id: Uuid) -> NewReplacementRequest {
        NewReplacementRequest {
            portal_key: "acme".into(),
            lead_event_id,
            requested_at: OffsetDateTime::now_utc(),
            reason: ReplacementReason::WrongNumber,
            contact_attempted_at: None,
            contact_attempt_method: None,
            evidence_notes: None,
            evidence_urls: Vec::new(),
            requested_by: None,
            policy: PolicyChecks {
                within_one_week: true,
                contacted_within_15m: true,
                reason_eligible: true,
                lead_status_eligible: true,
            },
            mandatory_review: false,
            status: ReplacementStatus::Submitted,
        }
    }

    fn approval(request_id: Uuid) -> ReplacementResolution {
        ReplacementResolution {
            request_id,
            approve: true,
            resolved_by: "ops".into(),
            notes: None,
            resolved_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_second_open_request_for_lead_is_stored_rejected() {
        let store = MemoryLedgerStore::new();
        store
            .seed_organization(org("acme", BillingModel::PayPerLeadPerpetual, 0))
            .await;
        let lead = store
            .record_lead_event(delivery("acme", "k", "s"))
            .await
            .unwrap()
            .event;

        let first = store
            .insert_replacement_request(passing_request(lead.id))
            .await
            .unwrap();
        assert_eq!(first.status, ReplacementStatus::Submitted);
        assert!(store.has_open_replacement_request(lead.id).await.unwrap());

        let second = store
            .insert_replacement_request(passing_request(lead.id))
            .await
            .unwrap();
        assert_eq!(second.status, ReplacementStatus::AutoRejectedPolicy);
        assert!(!second.policy.lead_status_eligible);

        assert!(store.resolve_replacement_request(approval(first.id)).await.unwrap().updated);
        let again = store.resolve_replacement_request(approval(second.id)).await.unwrap();
        assert!(!again.updated);
        assert_eq!(again.request.status, ReplacementStatus::AutoRejectedPolicy);
    }

    #[tokio::test]
    async fn test_resolution_conflicts_when_lead_invalidated() {
        let store = MemoryLedgerStore::new();
        store
            .seed_organization(org("acme", BillingModel::PayPerLeadPerpetual, 0))
            .await;
        let lead = store
            .record_lead_event(delivery("acme", "k", "s"))
            .await
            .unwrap()
            .event;
        let request = store
            .insert_replacement_request(passing_request(lead.id))
            .await
            .unwrap();
        store.invalidate_lead_event(lead.id).await.unwrap();

        let err = store
            .resolve_replacement_request(approval(request.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        let stored = store.get_replacement_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReplacementStatus::Submitted);
    }

    #[tokio::test]
    async fn test_webhook_claims_are_exclusive_until_failure() {
        let store = MemoryLedgerStore::new();
        let now = OffsetDateTime::now_utc();
        assert!(store.claim_webhook_event("evt_1", "invoice.paid", now).await.unwrap());
        assert!(!store.claim_webhook_event("evt_1", "invoice.paid", now).await.unwrap());

        store
            .finish_webhook_event("evt_1", "error", Some("stripe timeout"))
            .await
            .unwrap();
        assert!(store.claim_webhook_event("evt_1", "invoice.paid", now).await.unwrap());

        store.finish_webhook_event("evt_1", "success", None).await.unwrap();
        assert!(!store.claim_webhook_event("evt_1", "invoice.paid", now).await.unwrap());
    }
}

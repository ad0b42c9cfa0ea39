//! Ledger storage
//!
//! Every atomicity requirement of the ledger lives behind this trait: the
//! dual-key lead event insert with its credit decrement, the forward-only
//! intent transition, and the conditional replacement resolution. Services
//! above it hold no locks of their own, so any number of stateless replicas
//! can share one backend.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    BillingCustomer, BillingEvent, BillingModel, ContactInfo, IntentStatus, LeadEvent,
    LeadgenIntent, Organization, PolicyChecks, ReplacementReason, ReplacementRequest,
    ReplacementStatus, StripeIds,
};

/// Parameters for creating an organization
#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub portal_key: String,
    pub company_name: String,
    pub billing_model: BillingModel,
    pub prepaid_lead_credits: i64,
    pub lead_commitment_total: i64,
    pub lead_charge_threshold: i64,
    pub lead_unit_price_cents: i64,
    pub stripe: StripeIds,
}

/// Parameters for creating a leadgen intent
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub portal_key: String,
    pub company_name: String,
    pub billing_email: String,
    pub billing_model: BillingModel,
    pub token: String,
    pub token_expires_at: OffsetDateTime,
    pub status: IntentStatus,
    pub source: String,
    pub created_at: OffsetDateTime,
}

/// A normalized delivery ready for the ledger
#[derive(Debug, Clone)]
pub struct NewLeadEvent {
    pub portal_key: String,
    pub idempotency_key: String,
    pub source_external_id: String,
    pub delivered_at: OffsetDateTime,
    pub quantity: i64,
    pub contact: ContactInfo,
}

/// Result of the dual-key insert
#[derive(Debug, Clone)]
pub struct RecordedLeadEvent {
    pub event: LeadEvent,
    /// An existing row matched either uniqueness key
    pub duplicate: bool,
}

/// Parameters for storing a replacement request
#[derive(Debug, Clone)]
pub struct NewReplacementRequest {
    pub portal_key: String,
    pub lead_event_id: Uuid,
    pub requested_at: OffsetDateTime,
    pub reason: ReplacementReason,
    pub contact_attempted_at: Option<OffsetDateTime>,
    pub contact_attempt_method: Option<String>,
    pub evidence_notes: Option<String>,
    pub evidence_urls: Vec<String>,
    pub requested_by: Option<String>,
    pub policy: PolicyChecks,
    pub mandatory_review: bool,
    pub status: ReplacementStatus,
}

/// A human decision on a submitted replacement request
#[derive(Debug, Clone)]
pub struct ReplacementResolution {
    pub request_id: Uuid,
    pub approve: bool,
    pub resolved_by: String,
    pub notes: Option<String>,
    pub resolved_at: OffsetDateTime,
}

/// What a resolution call did
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    /// False when the request was already resolved
    pub updated: bool,
    pub request: ReplacementRequest,
    pub credits_restored: i64,
}

/// Parameters for an audit log entry
#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    pub portal_key: String,
    pub event_type: String,
    pub amount_cents: Option<i64>,
    pub lead_event_id: Option<Uuid>,
    pub stripe_reference: Option<String>,
    pub data: serde_json::Value,
}

/// Invitation bookkeeping for a billing customer
#[derive(Debug, Clone)]
pub struct InvitationRecord {
    pub portal_key: String,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub invitation_id: String,
    pub sent_at: OffsetDateTime,
}

/// Storage backend for the lead billing ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ─────────────────────────────── Organizations ───────────────────────────────

    async fn get_organization(&self, portal_key: &str) -> BillingResult<Option<Organization>>;

    /// Insert unless the portal key exists. Returns the row and whether it was created.
    async fn create_organization_if_absent(
        &self,
        org: NewOrganization,
    ) -> BillingResult<(Organization, bool)>;

    /// Fill in Stripe identifiers the organization does not have yet
    async fn attach_stripe_ids(
        &self,
        portal_key: &str,
        ids: &StripeIds,
    ) -> BillingResult<Organization>;

    /// Switch billing model. Fails with `Conflict` once leads exist unless
    /// `migration` is set; the change is audited in the same transaction.
    async fn change_billing_model(
        &self,
        portal_key: &str,
        model: BillingModel,
        migration: bool,
    ) -> BillingResult<Organization>;

    // ─────────────────────────────── Leadgen intents ─────────────────────────────

    async fn insert_intent(&self, intent: NewIntent) -> BillingResult<LeadgenIntent>;

    async fn find_intent_by_token(&self, token: &str) -> BillingResult<Option<LeadgenIntent>>;

    /// Most recently created intent for the portal key
    async fn find_intent_by_portal_key(
        &self,
        portal_key: &str,
    ) -> BillingResult<Option<LeadgenIntent>>;

    /// Non-completed, unexpired intent for (email, company), case-insensitive
    async fn find_active_intent(
        &self,
        billing_email: &str,
        company_name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<LeadgenIntent>>;

    /// Compare-and-swap the intent forward to `target`, stamping the
    /// timestamps of every state passed through. A no-op returning the
    /// current row when the intent is already at or past `target`.
    async fn advance_intent(
        &self,
        intent_id: Uuid,
        target: IntentStatus,
        at: OffsetDateTime,
        token_expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<LeadgenIntent>;

    // ─────────────────────────────── Lead events ─────────────────────────────────

    /// Insert-if-absent on either uniqueness key, deciding billable quantity
    /// and decrementing credits in the same transaction.
    async fn record_lead_event(&self, event: NewLeadEvent) -> BillingResult<RecordedLeadEvent>;

    async fn get_lead_event(&self, id: Uuid) -> BillingResult<Option<LeadEvent>>;

    async fn find_lead_event_by_source(
        &self,
        portal_key: &str,
        source_external_id: &str,
    ) -> BillingResult<Option<LeadEvent>>;

    /// Persist the usage record id once. Returns false if one was already set.
    async fn set_usage_record_id(
        &self,
        lead_event_id: Uuid,
        usage_record_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// `delivered → invalid`
    async fn invalidate_lead_event(&self, lead_event_id: Uuid) -> BillingResult<LeadEvent>;

    /// Delivered, billable events without a usage record, created before `older_than`
    async fn list_unreported_usage(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<LeadEvent>>;

    // ─────────────────────────────── Replacement requests ────────────────────────

    /// Whether the lead has a request that is awaiting review or approved
    async fn has_open_replacement_request(&self, lead_event_id: Uuid) -> BillingResult<bool>;

    /// Insert a request. A `submitted` request for a lead that already has an
    /// open one is stored as auto-rejected with `lead_status_eligible = false`.
    async fn insert_replacement_request(
        &self,
        request: NewReplacementRequest,
    ) -> BillingResult<ReplacementRequest>;

    async fn get_replacement_request(&self, id: Uuid) -> BillingResult<Option<ReplacementRequest>>;

    /// Conditional resolution guarded by `status = submitted`
    async fn resolve_replacement_request(
        &self,
        resolution: ReplacementResolution,
    ) -> BillingResult<ResolutionOutcome>;

    // ─────────────────────────────── Audit log ───────────────────────────────────

    async fn append_billing_event(&self, event: NewBillingEvent) -> BillingResult<BillingEvent>;

    async fn list_billing_events(&self, portal_key: &str) -> BillingResult<Vec<BillingEvent>>;

    // ─────────────────────────────── Billing customers ───────────────────────────

    async fn find_billing_customer(&self, email: &str) -> BillingResult<Option<BillingCustomer>>;

    /// Upsert by email, storing the latest invitation id and send time
    async fn record_invitation(&self, record: InvitationRecord) -> BillingResult<BillingCustomer>;

    // ─────────────────────────────── Payment webhooks ────────────────────────────

    /// Claim exclusive processing of a payment event. False if another
    /// worker holds a fresh claim or the event already succeeded. Events that
    /// failed, or whose claim went stale, can be claimed again.
    async fn claim_webhook_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        stripe_event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

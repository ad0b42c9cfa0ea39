//! Postgres ledger store
//!
//! Ledger mutations run in one transaction that row-locks the organization
//! (`SELECT ... FOR UPDATE`), so concurrent retries of the same delivery
//! serialize on the lock and the second writer sees the first writer's row.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    InvitationRecord, LedgerStore, NewBillingEvent, NewIntent, NewLeadEvent, NewOrganization,
    NewReplacementRequest, RecordedLeadEvent, ReplacementResolution, ResolutionOutcome,
};
use crate::billable::{decide_billable, LedgerPosition};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType};
use crate::models::{
    BillingCustomer, BillingEvent, BillingModel, ContactInfo, IntentStatus, LeadEvent,
    LeadgenIntent, Organization, PolicyChecks, ReplacementRequest, ReplacementStatus, StripeIds,
};

const STALE_CLAIM_MINUTES: i32 = 30;

const ORG_COLUMNS: &str = "id, portal_key, company_name, billing_model, prepaid_lead_credits, \
     lead_commitment_total, lead_charge_threshold, lead_unit_price_cents, stripe_customer_id, \
     stripe_subscription_id, stripe_subscription_item_id, active, onboarding_status, \
     created_at, updated_at";

const INTENT_COLUMNS: &str = "id, portal_key, company_name, billing_email, billing_model, token, \
     token_expires_at, status, source, paid_at, invited_at, onboarding_completed_at, \
     created_at, updated_at";

const LEAD_EVENT_COLUMNS: &str = "id, portal_key, idempotency_key, source_external_id, \
     delivered_at, quantity, status, billable_quantity, credits_consumed, \
     billing_skipped_reason, stripe_usage_record_id, usage_recorded_at, contact_name, \
     contact_email, contact_phone, contact_address, created_at";

const REPLACEMENT_COLUMNS: &str = "id, portal_key, lead_event_id, requested_at, reason, \
     contact_attempted_at, contact_attempt_method, evidence_notes, evidence_urls, requested_by, \
     within_one_week, contacted_within_15m, reason_eligible, lead_status_eligible, \
     mandatory_review, status, resolved_by, resolution_notes, resolved_at, created_at";

const BILLING_EVENT_COLUMNS: &str =
    "id, portal_key, event_type, amount_cents, lead_event_id, stripe_reference, data, created_at";

const CUSTOMER_COLUMNS: &str =
    "id, portal_key, email, stripe_customer_id, invitation_id, invitation_sent_at";

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    portal_key: String,
    company_name: String,
    billing_model: String,
    prepaid_lead_credits: i64,
    lead_commitment_total: i64,
    lead_charge_threshold: i64,
    lead_unit_price_cents: i64,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_subscription_item_id: Option<String>,
    active: bool,
    onboarding_status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = BillingError;

    fn try_from(row: OrganizationRow) -> Result<Self, Self::Error> {
        Ok(Organization {
            id: row.id,
            portal_key: row.portal_key,
            company_name: row.company_name,
            billing_model: row.billing_model.parse()?,
            prepaid_lead_credits: row.prepaid_lead_credits,
            lead_commitment_total: row.lead_commitment_total,
            lead_charge_threshold: row.lead_charge_threshold,
            lead_unit_price_cents: row.lead_unit_price_cents,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_subscription_item_id: row.stripe_subscription_item_id,
            active: row.active,
            onboarding_status: row.onboarding_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    portal_key: String,
    company_name: String,
    billing_email: String,
    billing_model: String,
    token: String,
    token_expires_at: OffsetDateTime,
    status: String,
    source: String,
    paid_at: Option<OffsetDateTime>,
    invited_at: Option<OffsetDateTime>,
    onboarding_completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<IntentRow> for LeadgenIntent {
    type Error = BillingError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(LeadgenIntent {
            id: row.id,
            portal_key: row.portal_key,
            company_name: row.company_name,
            billing_email: row.billing_email,
            billing_model: row.billing_model.parse()?,
            token: row.token,
            token_expires_at: row.token_expires_at,
            status: row.status.parse()?,
            source: row.source,
            paid_at: row.paid_at,
            invited_at: row.invited_at,
            onboarding_completed_at: row.onboarding_completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeadEventRow {
    id: Uuid,
    portal_key: String,
    idempotency_key: String,
    source_external_id: String,
    delivered_at: OffsetDateTime,
    quantity: i64,
    status: String,
    billable_quantity: i64,
    credits_consumed: i64,
    billing_skipped_reason: Option<String>,
    stripe_usage_record_id: Option<String>,
    usage_recorded_at: Option<OffsetDateTime>,
    contact_name: Option<String>,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    contact_address: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<LeadEventRow> for LeadEvent {
    type Error = BillingError;

    fn try_from(row: LeadEventRow) -> Result<Self, Self::Error> {
        Ok(LeadEvent {
            id: row.id,
            portal_key: row.portal_key,
            idempotency_key: row.idempotency_key,
            source_external_id: row.source_external_id,
            delivered_at: row.delivered_at,
            quantity: row.quantity,
            status: row.status.parse()?,
            billable_quantity: row.billable_quantity,
            credits_consumed: row.credits_consumed,
            billing_skipped_reason: row.billing_skipped_reason,
            stripe_usage_record_id: row.stripe_usage_record_id,
            usage_recorded_at: row.usage_recorded_at,
            contact: ContactInfo {
                name: row.contact_name,
                email: row.contact_email,
                phone: row.contact_phone,
                address: row.contact_address,
            },
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReplacementRow {
    id: Uuid,
    portal_key: String,
    lead_event_id: Uuid,
    requested_at: OffsetDateTime,
    reason: String,
    contact_attempted_at: Option<OffsetDateTime>,
    contact_attempt_method: Option<String>,
    evidence_notes: Option<String>,
    evidence_urls: Json<Vec<String>>,
    requested_by: Option<String>,
    within_one_week: bool,
    contacted_within_15m: bool,
    reason_eligible: bool,
    lead_status_eligible: bool,
    mandatory_review: bool,
    status: String,
    resolved_by: Option<String>,
    resolution_notes: Option<String>,
    resolved_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<ReplacementRow> for ReplacementRequest {
    type Error = BillingError;

    fn try_from(row: ReplacementRow) -> Result<Self, Self::Error> {
        Ok(ReplacementRequest {
            id: row.id,
            portal_key: row.portal_key,
            lead_event_id: row.lead_event_id,
            requested_at: row.requested_at,
            reason: row.reason.parse()?,
            contact_attempted_at: row.contact_attempted_at,
            contact_attempt_method: row.contact_attempt_method,
            evidence_notes: row.evidence_notes,
            evidence_urls: row.evidence_urls.0,
            requested_by: row.requested_by,
            policy: PolicyChecks {
                within_one_week: row.within_one_week,
                contacted_within_15m: row.contacted_within_15m,
                reason_eligible: row.reason_eligible,
                lead_status_eligible: row.lead_status_eligible,
            },
            mandatory_review: row.mandatory_review,
            status: row.status.parse()?,
            resolved_by: row.resolved_by,
            resolution_notes: row.resolution_notes,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BillingEventRow {
    id: Uuid,
    portal_key: String,
    event_type: String,
    amount_cents: Option<i64>,
    lead_event_id: Option<Uuid>,
    stripe_reference: Option<String>,
    data: serde_json::Value,
    created_at: OffsetDateTime,
}

impl From<BillingEventRow> for BillingEvent {
    fn from(row: BillingEventRow) -> Self {
        BillingEvent {
            id: row.id,
            portal_key: row.portal_key,
            event_type: row.event_type,
            amount_cents: row.amount_cents,
            lead_event_id: row.lead_event_id,
            stripe_reference: row.stripe_reference,
            data: row.data,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    portal_key: String,
    email: String,
    stripe_customer_id: Option<String>,
    invitation_id: Option<String>,
    invitation_sent_at: Option<OffsetDateTime>,
}

impl From<CustomerRow> for BillingCustomer {
    fn from(row: CustomerRow) -> Self {
        BillingCustomer {
            id: row.id,
            portal_key: row.portal_key,
            email: row.email,
            stripe_customer_id: row.stripe_customer_id,
            invitation_id: row.invitation_id,
            invitation_sent_at: row.invitation_sent_at,
        }
    }
}

async fn insert_billing_event(
    conn: &mut PgConnection,
    event: NewBillingEvent,
) -> BillingResult<BillingEvent> {
    let row: BillingEventRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO billing_events
            (portal_key, event_type, amount_cents, lead_event_id, stripe_reference, data)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        BILLING_EVENT_COLUMNS
    ))
    .bind(&event.portal_key)
    .bind(&event.event_type)
    .bind(event.amount_cents)
    .bind(event.lead_event_id)
    .bind(&event.stripe_reference)
    .bind(&event.data)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.into())
}

async fn lock_organization(
    conn: &mut PgConnection,
    portal_key: &str,
) -> BillingResult<Organization> {
    let row: Option<OrganizationRow> = sqlx::query_as(&format!(
        "SELECT {} FROM organizations WHERE portal_key = $1 FOR UPDATE",
        ORG_COLUMNS
    ))
    .bind(portal_key)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| BillingError::NotFound(format!("organization {}", portal_key)))?
        .try_into()
}

async fn count_lead_events(conn: &mut PgConnection, portal_key: &str) -> BillingResult<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lead_events WHERE portal_key = $1")
        .bind(portal_key)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Count of prior events and units delivered without a charge
async fn delivery_totals(conn: &mut PgConnection, portal_key: &str) -> BillingResult<(i64, i64)> {
    let totals: (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(quantity - billable_quantity) FILTER (WHERE status <> 'credited'), 0)::BIGINT
        FROM lead_events
        WHERE portal_key = $1
        "#,
    )
    .bind(portal_key)
    .fetch_one(&mut *conn)
    .await?;
    Ok(totals)
}

/// Ledger store backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_intent(&self, intent_id: Uuid) -> BillingResult<Option<LeadgenIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leadgen_intents WHERE id = $1",
            INTENT_COLUMNS
        ))
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_organization(&self, portal_key: &str) -> BillingResult<Option<Organization>> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations WHERE portal_key = $1",
            ORG_COLUMNS
        ))
        .bind(portal_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn create_organization_if_absent(
        &self,
        org: NewOrganization,
    ) -> BillingResult<(Organization, bool)> {
        let inserted: Option<OrganizationRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO organizations
                (portal_key, company_name, billing_model, prepaid_lead_credits,
                 lead_commitment_total, lead_charge_threshold, lead_unit_price_cents,
                 stripe_customer_id, stripe_subscription_id, stripe_subscription_item_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (portal_key) DO NOTHING
            RETURNING {}
            "#,
            ORG_COLUMNS
        ))
        .bind(&org.portal_key)
        .bind(&org.company_name)
        .bind(org.billing_model.as_str())
        .bind(org.prepaid_lead_credits.max(0))
        .bind(org.lead_commitment_total.max(0))
        .bind(org.lead_charge_threshold)
        .bind(org.lead_unit_price_cents)
        .bind(&org.stripe.customer_id)
        .bind(&org.stripe.subscription_id)
        .bind(&org.stripe.subscription_item_id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok((row.try_into()?, true)),
            None => {
                let existing = self.get_organization(&org.portal_key).await?.ok_or_else(|| {
                    BillingError::Internal(format!(
                        "organization {} vanished after insert conflict",
                        org.portal_key
                    ))
                })?;
                Ok((existing, false))
            }
        }
    }

    async fn attach_stripe_ids(
        &self,
        portal_key: &str,
        ids: &StripeIds,
    ) -> BillingResult<Organization> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                stripe_customer_id = COALESCE(stripe_customer_id, $2),
                stripe_subscription_id = COALESCE(stripe_subscription_id, $3),
                stripe_subscription_item_id = COALESCE(stripe_subscription_item_id, $4),
                updated_at = NOW()
            WHERE portal_key = $1
            RETURNING {}
            "#,
            ORG_COLUMNS
        ))
        .bind(portal_key)
        .bind(&ids.customer_id)
        .bind(&ids.subscription_id)
        .bind(&ids.subscription_item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("organization {}", portal_key)))?
            .try_into()
    }

    async fn change_billing_model(
        &self,
        portal_key: &str,
        model: BillingModel,
        migration: bool,
    ) -> BillingResult<Organization> {
        let mut tx = self.pool.begin().await?;
        let current = lock_organization(&mut tx, portal_key).await?;
        if current.billing_model == model {
            return Ok(current);
        }

        let lead_count = count_lead_events(&mut tx, portal_key).await?;
        if lead_count > 0 && !migration {
            return Err(BillingError::Conflict(format!(
                "organization {} has {} lead events billed under {}",
                portal_key, lead_count, current.billing_model
            )));
        }

        let defaults = model.defaults();
        let row: OrganizationRow = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                billing_model = $2,
                lead_commitment_total = $3,
                prepaid_lead_credits = CASE WHEN $4 THEN $5 ELSE prepaid_lead_credits END,
                updated_at = NOW()
            WHERE portal_key = $1
            RETURNING {}
            "#,
            ORG_COLUMNS
        ))
        .bind(portal_key)
        .bind(model.as_str())
        .bind(defaults.lead_commitment_total)
        .bind(lead_count == 0)
        .bind(defaults.prepaid_lead_credits)
        .fetch_one(&mut *tx)
        .await?;

        insert_billing_event(
            &mut tx,
            BillingEventBuilder::new(portal_key, BillingEventType::BillingModelChanged)
                .data(serde_json::json!({
                    "from": current.billing_model.as_str(),
                    "to": model.as_str(),
                    "migration": migration,
                    "lead_events": lead_count,
                }))
                .build(),
        )
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn insert_intent(&self, intent: NewIntent) -> BillingResult<LeadgenIntent> {
        let at = intent.created_at;
        let stamp = |status: IntentStatus| (intent.status >= status).then_some(at);
        let row: IntentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO leadgen_intents
                (portal_key, company_name, billing_email, billing_model, token, token_expires_at,
                 status, source, paid_at, invited_at, onboarding_completed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING {}
            "#,
            INTENT_COLUMNS
        ))
        .bind(&intent.portal_key)
        .bind(&intent.company_name)
        .bind(&intent.billing_email)
        .bind(intent.billing_model.as_str())
        .bind(&intent.token)
        .bind(intent.token_expires_at)
        .bind(intent.status.as_str())
        .bind(&intent.source)
        .bind(stamp(IntentStatus::Paid))
        .bind(stamp(IntentStatus::Invited))
        .bind(stamp(IntentStatus::OnboardingCompleted))
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn find_intent_by_token(&self, token: &str) -> BillingResult<Option<LeadgenIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leadgen_intents WHERE token = $1",
            INTENT_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_intent_by_portal_key(
        &self,
        portal_key: &str,
    ) -> BillingResult<Option<LeadgenIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM leadgen_intents WHERE portal_key = $1 ORDER BY created_at DESC LIMIT 1",
            INTENT_COLUMNS
        ))
        .bind(portal_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_active_intent(
        &self,
        billing_email: &str,
        company_name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<LeadgenIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM leadgen_intents
            WHERE lower(billing_email) = lower($1)
              AND lower(company_name) = lower($2)
              AND status <> 'onboarding_completed'
              AND token_expires_at > $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INTENT_COLUMNS
        ))
        .bind(billing_email)
        .bind(company_name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn advance_intent(
        &self,
        intent_id: Uuid,
        target: IntentStatus,
        at: OffsetDateTime,
        token_expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<LeadgenIntent> {
        let advanced: Option<IntentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE leadgen_intents SET
                status = $2,
                paid_at = CASE WHEN $3 >= 1 THEN COALESCE(paid_at, $4) ELSE paid_at END,
                invited_at = CASE WHEN $3 >= 2 THEN COALESCE(invited_at, $4) ELSE invited_at END,
                onboarding_completed_at = CASE WHEN $3 >= 3
                    THEN COALESCE(onboarding_completed_at, $4)
                    ELSE onboarding_completed_at END,
                token_expires_at = COALESCE($5, token_expires_at),
                updated_at = $4
            WHERE id = $1
              AND (CASE status
                    WHEN 'checkout_created' THEN 0
                    WHEN 'paid' THEN 1
                    WHEN 'invited' THEN 2
                    ELSE 3
                   END) < $3
            RETURNING {}
            "#,
            INTENT_COLUMNS
        ))
        .bind(intent_id)
        .bind(target.as_str())
        .bind(target.rank())
        .bind(at)
        .bind(token_expires_at)
        .fetch_optional(&self.pool)
        .await?;

        match advanced {
            Some(row) => row.try_into(),
            None => self
                .fetch_intent(intent_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("leadgen intent {}", intent_id))),
        }
    }

    async fn record_lead_event(&self, event: NewLeadEvent) -> BillingResult<RecordedLeadEvent> {
        if event.quantity < 1 {
            return Err(BillingError::InvalidInput(
                "quantity must be at least 1".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let org = lock_organization(&mut tx, &event.portal_key).await?;

        let existing: Option<LeadEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM lead_events
            WHERE portal_key = $1 AND (idempotency_key = $2 OR source_external_id = $3)
            ORDER BY created_at
            LIMIT 1
            "#,
            LEAD_EVENT_COLUMNS
        ))
        .bind(&event.portal_key)
        .bind(&event.idempotency_key)
        .bind(&event.source_external_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(RecordedLeadEvent {
                event: row.try_into()?,
                duplicate: true,
            });
        }

        let (prior_deliveries, covered_units) = delivery_totals(&mut tx, &event.portal_key).await?;
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

        if decision.credits_consumed > 0 {
            sqlx::query(
                r#"
                UPDATE organizations
                SET prepaid_lead_credits = prepaid_lead_credits - $2, updated_at = NOW()
                WHERE portal_key = $1
                "#,
            )
            .bind(&event.portal_key)
            .bind(decision.credits_consumed)
            .execute(&mut *tx)
            .await?;
        }

        let row: LeadEventRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO lead_events
                (portal_key, idempotency_key, source_external_id, delivered_at, quantity,
                 status, billable_quantity, credits_consumed, billing_skipped_reason,
                 contact_name, contact_email, contact_phone, contact_address)
            VALUES ($1, $2, $3, $4, $5, 'delivered', $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            LEAD_EVENT_COLUMNS
        ))
        .bind(&event.portal_key)
        .bind(&event.idempotency_key)
        .bind(&event.source_external_id)
        .bind(event.delivered_at)
        .bind(event.quantity)
        .bind(decision.billable_quantity)
        .bind(decision.credits_consumed)
        .bind(decision.skipped_reason)
        .bind(&event.contact.name)
        .bind(&event.contact.email)
        .bind(&event.contact.phone)
        .bind(&event.contact.address)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordedLeadEvent {
            event: row.try_into()?,
            duplicate: false,
        })
    }

    async fn get_lead_event(&self, id: Uuid) -> BillingResult<Option<LeadEvent>> {
        let row: Option<LeadEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM lead_events WHERE id = $1",
            LEAD_EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_lead_event_by_source(
        &self,
        portal_key: &str,
        source_external_id: &str,
    ) -> BillingResult<Option<LeadEvent>> {
        let row: Option<LeadEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM lead_events WHERE portal_key = $1 AND source_external_id = $2",
            LEAD_EVENT_COLUMNS
        ))
        .bind(portal_key)
        .bind(source_external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn set_usage_record_id(
        &self,
        lead_event_id: Uuid,
        usage_record_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lead_events
            SET stripe_usage_record_id = $2, usage_recorded_at = $3, updated_at = NOW()
            WHERE id = $1 AND stripe_usage_record_id IS NULL
            "#,
        )
        .bind(lead_event_id)
        .bind(usage_record_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_lead_event(lead_event_id).await? {
            Some(_) => Ok(false),
            None => Err(BillingError::NotFound(format!(
                "lead event {}",
                lead_event_id
            ))),
        }
    }

    async fn invalidate_lead_event(&self, lead_event_id: Uuid) -> BillingResult<LeadEvent> {
        let row: Option<LeadEventRow> = sqlx::query_as(&format!(
            r#"
            UPDATE lead_events SET status = 'invalid', updated_at = NOW()
            WHERE id = $1 AND status = 'delivered'
            RETURNING {}
            "#,
            LEAD_EVENT_COLUMNS
        ))
        .bind(lead_event_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.try_into();
        }
        match self.get_lead_event(lead_event_id).await? {
            Some(event) => Err(BillingError::Conflict(format!(
                "lead event {} is {}",
                lead_event_id, event.status
            ))),
            None => Err(BillingError::NotFound(format!(
                "lead event {}",
                lead_event_id
            ))),
        }
    }

    async fn list_unreported_usage(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<LeadEvent>> {
        let rows: Vec<LeadEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM lead_events
            WHERE billable_quantity > 0
              AND stripe_usage_record_id IS NULL
              AND status = 'delivered'
              AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
            LEAD_EVENT_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn has_open_replacement_request(&self, lead_event_id: Uuid) -> BillingResult<bool> {
        let open: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM lead_replacement_requests
                WHERE lead_event_id = $1 AND status IN ('submitted', 'approved')
            )
            "#,
        )
        .bind(lead_event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(open)
    }

    async fn insert_replacement_request(
        &self,
        mut request: NewReplacementRequest,
    ) -> BillingResult<ReplacementRequest> {
        let mut tx = self.pool.begin().await?;

        // Serializes submissions for the same lead
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM lead_events WHERE id = $1 FOR UPDATE")
                .bind(request.lead_event_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(BillingError::NotFound(format!(
                "lead event {}",
                request.lead_event_id
            )));
        }

        if request.status == ReplacementStatus::Submitted {
            let open: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM lead_replacement_requests
                    WHERE lead_event_id = $1 AND status IN ('submitted', 'approved')
                )
                "#,
            )
            .bind(request.lead_event_id)
            .fetch_one(&mut *tx)
            .await?;
            if open {
                request.policy.lead_status_eligible = false;
                request.status = ReplacementStatus::AutoRejectedPolicy;
            }
        }

        let row: ReplacementRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO lead_replacement_requests
                (portal_key, lead_event_id, requested_at, reason, contact_attempted_at,
                 contact_attempt_method, evidence_notes, evidence_urls, requested_by,
                 within_one_week, contacted_within_15m, reason_eligible, lead_status_eligible,
                 mandatory_review, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {}
            "#,
            REPLACEMENT_COLUMNS
        ))
        .bind(&request.portal_key)
        .bind(request.lead_event_id)
        .bind(request.requested_at)
        .bind(request.reason.as_str())
        .bind(request.contact_attempted_at)
        .bind(&request.contact_attempt_method)
        .bind(&request.evidence_notes)
        .bind(Json(&request.evidence_urls))
        .bind(&request.requested_by)
        .bind(request.policy.within_one_week)
        .bind(request.policy.contacted_within_15m)
        .bind(request.policy.reason_eligible)
        .bind(request.policy.lead_status_eligible)
        .bind(request.mandatory_review)
        .bind(request.status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_replacement_request(&self, id: Uuid) -> BillingResult<Option<ReplacementRequest>> {
        let row: Option<ReplacementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM lead_replacement_requests WHERE id = $1",
            REPLACEMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn resolve_replacement_request(
        &self,
        resolution: ReplacementResolution,
    ) -> BillingResult<ResolutionOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: ReplacementRequest = sqlx::query_as::<_, ReplacementRow>(&format!(
            "SELECT {} FROM lead_replacement_requests WHERE id = $1 FOR UPDATE",
            REPLACEMENT_COLUMNS
        ))
        .bind(resolution.request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("replacement request {}", resolution.request_id))
        })?
        .try_into()?;

        if current.status != ReplacementStatus::Submitted {
            tx.rollback().await?;
            return Ok(ResolutionOutcome {
                updated: false,
                request: current,
                credits_restored: 0,
            });
        }

        let mut credits_restored = 0;
        if resolution.approve {
            let org = lock_organization(&mut tx, &current.portal_key).await?;

            let credited: Option<(i64, i64)> = sqlx::query_as(
                r#"
                UPDATE lead_events SET status = 'credited', updated_at = NOW()
                WHERE id = $1 AND status = 'delivered'
                RETURNING credits_consumed, billable_quantity
                "#,
            )
            .bind(current.lead_event_id)
            .fetch_optional(&mut *tx)
            .await?;

            // Dropping the transaction rolls back
            let (credits_consumed, billable_quantity) = credited.ok_or_else(|| {
                BillingError::Conflict(format!(
                    "lead event {} is no longer delivered",
                    current.lead_event_id
                ))
            })?;

            if credits_consumed > 0 {
                sqlx::query(
                    r#"
                    UPDATE organizations
                    SET prepaid_lead_credits = prepaid_lead_credits + $2, updated_at = NOW()
                    WHERE portal_key = $1
                    "#,
                )
                .bind(&current.portal_key)
                .bind(credits_consumed)
                .execute(&mut *tx)
                .await?;
            }
            credits_restored = credits_consumed;

            if billable_quantity > 0 {
                insert_billing_event(
                    &mut tx,
                    BillingEventBuilder::new(
                        &current.portal_key,
                        BillingEventType::LeadReplacementCredit,
                    )
                    .amount_cents(billable_quantity * org.lead_unit_price_cents)
                    .lead_event(current.lead_event_id)
                    .data(serde_json::json!({
                        "replacement_request_id": resolution.request_id,
                        "billable_quantity": billable_quantity,
                    }))
                    .build(),
                )
                .await?;
            }
        }

        let (status, event_type) = if resolution.approve {
            (
                ReplacementStatus::Approved,
                BillingEventType::ReplacementApproved,
            )
        } else {
            (
                ReplacementStatus::Rejected,
                BillingEventType::ReplacementRejected,
            )
        };

        let row: ReplacementRow = sqlx::query_as(&format!(
            r#"
            UPDATE lead_replacement_requests SET
                status = $2, resolved_by = $3, resolution_notes = $4, resolved_at = $5
            WHERE id = $1 AND status = 'submitted'
            RETURNING {}
            "#,
            REPLACEMENT_COLUMNS
        ))
        .bind(resolution.request_id)
        .bind(status.as_str())
        .bind(&resolution.resolved_by)
        .bind(&resolution.notes)
        .bind(resolution.resolved_at)
        .fetch_one(&mut *tx)
        .await?;

        insert_billing_event(
            &mut tx,
            BillingEventBuilder::new(&current.portal_key, event_type)
                .lead_event(current.lead_event_id)
                .data(serde_json::json!({
                    "replacement_request_id": resolution.request_id,
                    "reason": current.reason.as_str(),
                    "resolved_by": resolution.resolved_by,
                    "credits_restored": credits_restored,
                }))
                .build(),
        )
        .await?;

        tx.commit().await?;
        Ok(ResolutionOutcome {
            updated: true,
            request: row.try_into()?,
            credits_restored,
        })
    }

    async fn append_billing_event(&self, event: NewBillingEvent) -> BillingResult<BillingEvent> {
        let mut conn = self.pool.acquire().await?;
        insert_billing_event(&mut conn, event).await
    }

    async fn list_billing_events(&self, portal_key: &str) -> BillingResult<Vec<BillingEvent>> {
        let rows: Vec<BillingEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_events WHERE portal_key = $1 ORDER BY created_at",
            BILLING_EVENT_COLUMNS
        ))
        .bind(portal_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_billing_customer(&self, email: &str) -> BillingResult<Option<BillingCustomer>> {
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_customers WHERE lower(email) = lower($1)",
            CUSTOMER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn record_invitation(&self, record: InvitationRecord) -> BillingResult<BillingCustomer> {
        let row: CustomerRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_customers
                (portal_key, email, stripe_customer_id, invitation_id, invitation_sent_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT ((lower(email))) DO UPDATE SET
                portal_key = EXCLUDED.portal_key,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, billing_customers.stripe_customer_id),
                invitation_id = EXCLUDED.invitation_id,
                invitation_sent_at = EXCLUDED.invitation_sent_at,
                updated_at = NOW()
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        ))
        .bind(&record.portal_key)
        .bind(&record.email)
        .bind(&record.stripe_customer_id)
        .bind(&record.invitation_id)
        .bind(record.sent_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn claim_webhook_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Only one concurrent caller gets a row back
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE payment_webhook_events.processing_result = 'error'
               OR (payment_webhook_events.processing_result = 'processing'
                   AND payment_webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(stripe_event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(STALE_CLAIM_MINUTES)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        stripe_event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_webhook_events
            SET processing_result = $2, error_message = $3
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Run against a disposable database:
/// `DATABASE_URL=postgres://... cargo test -p leadgen-billing -- --ignored`
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReplacementReason;
    use sqlx::postgres::PgPoolOptions;

    async fn setup_test_store() -> PgLedgerStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/leadgen_test".to_string());
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .expect("Failed to migrate test database");
        PgLedgerStore::new(pool)
    }

    /// Fresh organization per test so runs do not collide
    async fn seed_org(store: &PgLedgerStore, model: BillingModel, credits: i64) -> String {
        let portal_key = format!("test-{}", Uuid::new_v4());
        store
            .create_organization_if_absent(NewOrganization {
                portal_key: portal_key.clone(),
                company_name: "Test Roofing".into(),
                billing_model: model,
                prepaid_lead_credits: credits,
                lead_commitment_total: 40,
                lead_charge_threshold: 1,
                lead_unit_price_cents: 4500,
                stripe: StripeIds::default(),
            })
            .await
            .unwrap();
        portal_key
    }

    fn delivery(portal_key: &str, key: &str) -> NewLeadEvent {
        NewLeadEvent {
            portal_key: portal_key.to_string(),
            idempotency_key: key.to_string(),
            source_external_id: format!("src-{}", key),
            delivered_at: OffsetDateTime::now_utc(),
            quantity: 1,
            contact: ContactInfo::default(),
        }
    }

    fn submitted_request(portal_key: &str, lead_event_id: Uuid) -> NewReplacementRequest {
        NewReplacementRequest {
            portal_key: portal_key.to_string(),
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

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_concurrent_retries_insert_once_and_decrement_once() {
        let store = setup_test_store().await;
        let portal_key = seed_org(&store, BillingModel::Package40PaidInFull, 3).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let event = delivery(&portal_key, "retry-1");
            handles.push(tokio::spawn(async move {
                store.record_lead_event(event).await.unwrap()
            }));
        }
        let mut fresh = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let recorded = handle.await.unwrap();
            if !recorded.duplicate {
                fresh += 1;
            }
            ids.push(recorded.event.id);
        }
        assert_eq!(fresh, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let org = store.get_organization(&portal_key).await.unwrap().unwrap();
        assert_eq!(org.prepaid_lead_credits, 2);
    }

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_either_key_matches_existing_event() {
        let store = setup_test_store().await;
        let portal_key = seed_org(&store, BillingModel::PayPerLeadPerpetual, 0).await;

        let original = store.record_lead_event(delivery(&portal_key, "a")).await.unwrap();
        let mut same_source = delivery(&portal_key, "b");
        same_source.source_external_id = "src-a".into();
        let replay = store.record_lead_event(same_source).await.unwrap();

        assert!(replay.duplicate);
        assert_eq!(replay.event.id, original.event.id);
    }

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_concurrent_resolutions_update_once() {
        let store = setup_test_store().await;
        let portal_key = seed_org(&store, BillingModel::Package40PaidInFull, 5).await;
        let lead = store
            .record_lead_event(delivery(&portal_key, "disputed"))
            .await
            .unwrap()
            .event;
        let request = store
            .insert_replacement_request(submitted_request(&portal_key, lead.id))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .resolve_replacement_request(ReplacementResolution {
                        request_id: request.id,
                        approve: i % 2 == 0,
                        resolved_by: "ops".into(),
                        notes: None,
                        resolved_at: OffsetDateTime::now_utc(),
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut updated = 0;
        for handle in handles {
            if handle.await.unwrap().updated {
                updated += 1;
            }
        }
        assert_eq!(updated, 1);

        let org = store.get_organization(&portal_key).await.unwrap().unwrap();
        assert!(org.prepaid_lead_credits == 4 || org.prepaid_lead_credits == 5);
    }

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_concurrent_disputes_leave_one_open_request() {
        let store = setup_test_store().await;
        let portal_key = seed_org(&store, BillingModel::PayPerLeadPerpetual, 0).await;
        let lead = store
            .record_lead_event(delivery(&portal_key, "contested"))
            .await
            .unwrap()
            .event;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            let request = submitted_request(&portal_key, lead.id);
            handles.push(tokio::spawn(async move {
                store.insert_replacement_request(request).await.unwrap()
            }));
        }
        let mut open = 0;
        for handle in handles {
            let stored = handle.await.unwrap();
            if stored.status == ReplacementStatus::Submitted {
                open += 1;
            } else {
                assert!(!stored.policy.lead_status_eligible);
            }
        }
        assert_eq!(open, 1);
        assert!(store.has_open_replacement_request(lead.id).await.unwrap());
    }
}

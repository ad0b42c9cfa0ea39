//! Billing audit log
//!
//! Append-only entries per organization. Entries written inside a ledger
//! transaction go through the store directly; everything else goes through
//! [`BillingEventLogger`] and is best-effort at the call site.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::BillingEvent;
use crate::store::{LedgerStore, NewBillingEvent};

/// Kinds of audit entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    UsageReported,
    UsageReportFailed,
    BillingDefaultsApplied,
    BillingModelChanged,
    PaymentReceived,
    InvitationSent,
    InvitationRevoked,
    LeadInvalidated,
    ReplacementSubmitted,
    ReplacementAutoRejected,
    ReplacementApproved,
    ReplacementRejected,
    /// Refund-equivalent entry for an approved replacement on a billed lead
    LeadReplacementCredit,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::UsageReported => "usage_reported",
            BillingEventType::UsageReportFailed => "usage_report_failed",
            BillingEventType::BillingDefaultsApplied => "billing_defaults_applied",
            BillingEventType::BillingModelChanged => "billing_model_changed",
            BillingEventType::PaymentReceived => "payment_received",
            BillingEventType::InvitationSent => "invitation_sent",
            BillingEventType::InvitationRevoked => "invitation_revoked",
            BillingEventType::LeadInvalidated => "lead_invalidated",
            BillingEventType::ReplacementSubmitted => "replacement_submitted",
            BillingEventType::ReplacementAutoRejected => "replacement_auto_rejected",
            BillingEventType::ReplacementApproved => "replacement_approved",
            BillingEventType::ReplacementRejected => "replacement_rejected",
            BillingEventType::LeadReplacementCredit => "lead_replacement_credit",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for audit entries
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    portal_key: String,
    event_type: BillingEventType,
    amount_cents: Option<i64>,
    lead_event_id: Option<Uuid>,
    stripe_reference: Option<String>,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(portal_key: impl Into<String>, event_type: BillingEventType) -> Self {
        Self {
            portal_key: portal_key.into(),
            event_type,
            amount_cents: None,
            lead_event_id: None,
            stripe_reference: None,
            data: serde_json::json!({}),
        }
    }

    pub fn amount_cents(mut self, amount: i64) -> Self {
        self.amount_cents = Some(amount);
        self
    }

    pub fn lead_event(mut self, lead_event_id: Uuid) -> Self {
        self.lead_event_id = Some(lead_event_id);
        self
    }

    pub fn stripe_reference(mut self, reference: impl Into<String>) -> Self {
        self.stripe_reference = Some(reference.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> NewBillingEvent {
        NewBillingEvent {
            portal_key: self.portal_key,
            event_type: self.event_type.as_str().to_string(),
            amount_cents: self.amount_cents,
            lead_event_id: self.lead_event_id,
            stripe_reference: self.stripe_reference,
            data: self.data,
        }
    }
}

/// Writes audit entries outside ledger transactions
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn LedgerStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<BillingEvent> {
        self.store.append_billing_event(builder.build()).await
    }
}

//! Ledger domain types
//!
//! Closed enums for every status column, plus the records the store hands
//! back. Enums round-trip through their snake_case wire names so the same
//! strings are used in JSON payloads and in the database.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// How an organization pays for delivered leads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingModel {
    /// 40 leads bought up front; deliveries draw down prepaid credits
    #[serde(rename = "package_40_paid_in_full")]
    Package40PaidInFull,
    /// 40-lead commitment with 10 paid up front
    #[serde(rename = "commitment_40_with_10_upfront")]
    Commitment40With10Upfront,
    /// Metered, every lead billed
    #[serde(rename = "pay_per_lead_perpetual")]
    PayPerLeadPerpetual,
    /// Metered, the first lead is a free qualifying unit
    #[serde(rename = "pay_per_lead_40_first_lead")]
    PayPerLead40FirstLead,
}

/// Counters an organization starts with under a billing model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingDefaults {
    pub prepaid_lead_credits: i64,
    pub lead_commitment_total: i64,
}

impl BillingModel {
    pub const ALL: [BillingModel; 4] = [
        BillingModel::Package40PaidInFull,
        BillingModel::Commitment40With10Upfront,
        BillingModel::PayPerLeadPerpetual,
        BillingModel::PayPerLead40FirstLead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingModel::Package40PaidInFull => "package_40_paid_in_full",
            BillingModel::Commitment40With10Upfront => "commitment_40_with_10_upfront",
            BillingModel::PayPerLeadPerpetual => "pay_per_lead_perpetual",
            BillingModel::PayPerLead40FirstLead => "pay_per_lead_40_first_lead",
        }
    }

    /// Deliveries draw down prepaid credits before anything is billed
    pub fn is_credit_funded(&self) -> bool {
        matches!(
            self,
            BillingModel::Package40PaidInFull | BillingModel::Commitment40With10Upfront
        )
    }

    pub fn defaults(&self) -> BillingDefaults {
        match self {
            BillingModel::Package40PaidInFull => BillingDefaults {
                prepaid_lead_credits: 40,
                lead_commitment_total: 40,
            },
            BillingModel::Commitment40With10Upfront => BillingDefaults {
                prepaid_lead_credits: 10,
                lead_commitment_total: 40,
            },
            BillingModel::PayPerLeadPerpetual => BillingDefaults {
                prepaid_lead_credits: 0,
                lead_commitment_total: 0,
            },
            BillingModel::PayPerLead40FirstLead => BillingDefaults {
                prepaid_lead_credits: 0,
                lead_commitment_total: 40,
            },
        }
    }
}

impl fmt::Display for BillingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingModel {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BillingModel::ALL
            .into_iter()
            .find(|model| model.as_str() == s)
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown billing model '{}'", s)))
    }
}

/// Leadgen intent lifecycle. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    CheckoutCreated,
    Paid,
    Invited,
    OnboardingCompleted,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::CheckoutCreated => "checkout_created",
            IntentStatus::Paid => "paid",
            IntentStatus::Invited => "invited",
            IntentStatus::OnboardingCompleted => "onboarding_completed",
        }
    }

    /// Position in the lifecycle, used for SQL compare-and-swap
    pub fn rank(&self) -> i32 {
        match self {
            IntentStatus::CheckoutCreated => 0,
            IntentStatus::Paid => 1,
            IntentStatus::Invited => 2,
            IntentStatus::OnboardingCompleted => 3,
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkout_created" => Ok(IntentStatus::CheckoutCreated),
            "paid" => Ok(IntentStatus::Paid),
            "invited" => Ok(IntentStatus::Invited),
            "onboarding_completed" => Ok(IntentStatus::OnboardingCompleted),
            other => Err(BillingError::InvalidInput(format!(
                "unknown intent status '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of a delivered lead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadEventStatus {
    Delivered,
    Credited,
    Invalid,
}

impl LeadEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadEventStatus::Delivered => "delivered",
            LeadEventStatus::Credited => "credited",
            LeadEventStatus::Invalid => "invalid",
        }
    }

    /// `delivered` is the only state with outgoing transitions
    pub fn can_transition_to(&self, next: LeadEventStatus) -> bool {
        matches!(
            (self, next),
            (LeadEventStatus::Delivered, LeadEventStatus::Credited)
                | (LeadEventStatus::Delivered, LeadEventStatus::Invalid)
        )
    }
}

impl fmt::Display for LeadEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadEventStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(LeadEventStatus::Delivered),
            "credited" => Ok(LeadEventStatus::Credited),
            "invalid" => Ok(LeadEventStatus::Invalid),
            other => Err(BillingError::InvalidInput(format!(
                "unknown lead event status '{}'",
                other
            ))),
        }
    }
}

/// Why a contractor disputes a delivered lead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementReason {
    NeverAnswered,
    WrongNumber,
    DuplicateLead,
    OutsideServiceArea,
    ServiceNotOffered,
    SpamOrFake,
    OtherQualityIssue,
}

impl ReplacementReason {
    pub const ALL: [ReplacementReason; 7] = [
        ReplacementReason::NeverAnswered,
        ReplacementReason::WrongNumber,
        ReplacementReason::DuplicateLead,
        ReplacementReason::OutsideServiceArea,
        ReplacementReason::ServiceNotOffered,
        ReplacementReason::SpamOrFake,
        ReplacementReason::OtherQualityIssue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplacementReason::NeverAnswered => "never_answered",
            ReplacementReason::WrongNumber => "wrong_number",
            ReplacementReason::DuplicateLead => "duplicate_lead",
            ReplacementReason::OutsideServiceArea => "outside_service_area",
            ReplacementReason::ServiceNotOffered => "service_not_offered",
            ReplacementReason::SpamOrFake => "spam_or_fake",
            ReplacementReason::OtherQualityIssue => "other_quality_issue",
        }
    }
}

impl fmt::Display for ReplacementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplacementReason {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReplacementReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("unknown replacement reason '{}'", s))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementStatus {
    Submitted,
    Approved,
    Rejected,
    AutoRejectedPolicy,
}

impl ReplacementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplacementStatus::Submitted => "submitted",
            ReplacementStatus::Approved => "approved",
            ReplacementStatus::Rejected => "rejected",
            ReplacementStatus::AutoRejectedPolicy => "auto_rejected_policy",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplacementStatus::Submitted)
    }
}

impl fmt::Display for ReplacementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplacementStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(ReplacementStatus::Submitted),
            "approved" => Ok(ReplacementStatus::Approved),
            "rejected" => Ok(ReplacementStatus::Rejected),
            "auto_rejected_policy" => Ok(ReplacementStatus::AutoRejectedPolicy),
            other => Err(BillingError::InvalidInput(format!(
                "unknown replacement status '{}'",
                other
            ))),
        }
    }
}

/// Per-contractor billing configuration and counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub portal_key: String,
    pub company_name: String,
    pub billing_model: BillingModel,
    pub prepaid_lead_credits: i64,
    pub lead_commitment_total: i64,
    /// Units of accumulated usage before Stripe invoices. Enforced by the
    /// threshold on the Stripe price; every billable unit is still reported
    /// here as it is delivered.
    pub lead_charge_threshold: i64,
    pub lead_unit_price_cents: i64,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_subscription_item_id: Option<String>,
    pub active: bool,
    pub onboarding_status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Stripe identifiers that may be learned from a payment event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripeIds {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_item_id: Option<String>,
}

/// A prospect-to-customer acquisition attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadgenIntent {
    pub id: Uuid,
    pub portal_key: String,
    pub company_name: String,
    pub billing_email: String,
    pub billing_model: BillingModel,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub token_expires_at: OffsetDateTime,
    pub status: IntentStatus,
    pub source: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub invited_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub onboarding_completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl LeadgenIntent {
    pub fn token_is_live(&self, now: OffsetDateTime) -> bool {
        self.token_expires_at > now && self.status >= IntentStatus::Paid
    }

    /// Still counts toward the one-active-intent-per-customer rule
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.status != IntentStatus::OnboardingCompleted && self.token_expires_at > now
    }
}

/// Contact fields carried on a lead for dispute resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// One delivered-lead notification, recorded exactly once
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadEvent {
    pub id: Uuid,
    pub portal_key: String,
    pub idempotency_key: String,
    pub source_external_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub delivered_at: OffsetDateTime,
    pub quantity: i64,
    pub status: LeadEventStatus,
    pub billable_quantity: i64,
    pub credits_consumed: i64,
    pub billing_skipped_reason: Option<String>,
    pub stripe_usage_record_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub usage_recorded_at: Option<OffsetDateTime>,
    pub contact: ContactInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The four policy checks, stored verbatim on every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChecks {
    pub within_one_week: bool,
    #[serde(rename = "contactedWithin15m")]
    pub contacted_within_15m: bool,
    pub reason_eligible: bool,
    pub lead_status_eligible: bool,
}

impl PolicyChecks {
    pub fn all_passed(&self) -> bool {
        self.within_one_week
            && self.contacted_within_15m
            && self.reason_eligible
            && self.lead_status_eligible
    }

    /// Names of the checks that failed, in a stable order
    pub fn failed_checks(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.within_one_week {
            failed.push("withinOneWeek");
        }
        if !self.contacted_within_15m {
            failed.push("contactedWithin15m");
        }
        if !self.reason_eligible {
            failed.push("reasonEligible");
        }
        if !self.lead_status_eligible {
            failed.push("leadStatusEligible");
        }
        failed
    }
}

/// A contractor dispute over a delivered lead
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementRequest {
    pub id: Uuid,
    pub portal_key: String,
    pub lead_event_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    pub reason: ReplacementReason,
    #[serde(with = "time::serde::rfc3339::option")]
    pub contact_attempted_at: Option<OffsetDateTime>,
    pub contact_attempt_method: Option<String>,
    pub evidence_notes: Option<String>,
    pub evidence_urls: Vec<String>,
    pub requested_by: Option<String>,
    pub policy: PolicyChecks,
    pub mandatory_review: bool,
    pub status: ReplacementStatus,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only audit entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    pub id: Uuid,
    pub portal_key: String,
    pub event_type: String,
    pub amount_cents: Option<i64>,
    pub lead_event_id: Option<Uuid>,
    pub stripe_reference: Option<String>,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Billing-side customer record, used for activation idempotency
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingCustomer {
    pub id: Uuid,
    pub portal_key: String,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub invitation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub invitation_sent_at: Option<OffsetDateTime>,
}

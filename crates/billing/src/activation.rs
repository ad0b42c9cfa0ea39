//! Payment-to-portal activation
//!
//! A confirmed payment marks the intent paid, applies billing defaults and
//! then provisions portal access with one invitation per customer. The
//! invitation id stored on the billing customer is the idempotency record:
//! a second activation for the same customer is skipped unless forced, and a
//! forced resend revokes the previous invitation first.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::email::{ActivationNotice, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::intents::{LeadgenIntentStore, PaymentConfirmation};
use crate::invitation::{InvitationMetadata, InvitationProvider, InvitationRequest};
use crate::models::{BillingModel, IntentStatus, StripeIds};
use crate::organization::OrganizationBillingProfile;
use crate::store::{InvitationRecord, LedgerStore};

/// Journey where the customer pays before filling in the onboarding form
pub const JOURNEY_PAYMENT_FIRST: &str = "payment_first";

pub const SKIPPED_ALREADY_INVITED: &str = "already_invited";
pub const SKIPPED_RECURRING_CHARGE: &str = "recurring_charge";

#[derive(Debug, Clone)]
pub struct ActivationConfig {
    /// Landing page for invited customers
    pub portal_url: String,
    /// Base of the token-scoped onboarding form
    pub onboarding_base_url: String,
}

impl ActivationConfig {
    pub fn onboarding_url(&self, token: &str) -> String {
        format!("{}/{}", self.onboarding_base_url.trim_end_matches('/'), token)
    }
}

/// What kind of payment produced the candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeClassification {
    /// Checkout completion or the first invoice of a subscription
    Initial,
    /// Renewal invoice; never provisions on its own
    Recurring,
    /// One-off or manually created invoice
    OneOff,
    /// Operator-triggered activation
    Manual,
}

impl ChargeClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeClassification::Initial => "initial",
            ChargeClassification::Recurring => "recurring",
            ChargeClassification::OneOff => "one_off",
            ChargeClassification::Manual => "manual",
        }
    }
}

/// Everything activation needs to know about a payment
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationCandidate {
    pub customer_email: String,
    pub portal_key: Option<String>,
    pub company_name: String,
    pub billing_model: Option<BillingModel>,
    pub journey: Option<String>,
    pub stripe: StripeIds,
    pub amount_cents: Option<i64>,
    pub charge: ChargeClassification,
    /// Provider object the candidate was built from
    pub reference: String,
    pub origin: &'static str,
}

fn str_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Id of an expandable reference: a bare id string or an expanded object
fn expandable_id(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(expanded) => expanded
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn metadata(object: &Value) -> HashMap<String, String> {
    object
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.trim().to_string())))
                .filter(|(_, v)| !v.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn billing_model_from(metadata: &HashMap<String, String>) -> BillingResult<Option<BillingModel>> {
    metadata
        .get("billing_model")
        .map(|m| m.parse::<BillingModel>())
        .transpose()
}

impl ActivationCandidate {
    /// Candidate from a completed checkout session object
    pub fn from_checkout_session(session: &Value) -> BillingResult<Self> {
        let metadata = metadata(session);
        let customer_email = str_field(session, "customer_email")
            .or_else(|| {
                session
                    .get("customer_details")
                    .and_then(|d| str_field(d, "email"))
            })
            .ok_or_else(|| {
                BillingError::InvalidInput("checkout session has no customer email".into())
            })?
            .to_string();

        Ok(Self {
            customer_email,
            portal_key: metadata.get("portal_key").cloned(),
            company_name: metadata.get("company_name").cloned().unwrap_or_default(),
            billing_model: billing_model_from(&metadata)?,
            journey: metadata.get("journey").cloned(),
            stripe: StripeIds {
                customer_id: expandable_id(session, "customer"),
                subscription_id: expandable_id(session, "subscription"),
                subscription_item_id: None,
            },
            amount_cents: session.get("amount_total").and_then(Value::as_i64),
            charge: ChargeClassification::Initial,
            reference: str_field(session, "id").unwrap_or_default().to_string(),
            origin: "stripe_checkout",
        })
    }

    /// Candidate from a paid invoice object
    ///
    /// Metadata is read from the invoice, then its subscription details,
    /// then the first line item. The metered subscription item comes from the
    /// first line that references one.
    pub fn from_invoice(invoice: &Value) -> BillingResult<Self> {
        let lines: Vec<&Value> = invoice
            .get("lines")
            .and_then(|l| l.get("data"))
            .and_then(Value::as_array)
            .map(|data| data.iter().collect())
            .unwrap_or_default();

        let mut metadata = lines.first().copied().map(metadata).unwrap_or_default();
        if let Some(details) = invoice.get("subscription_details") {
            metadata.extend(self::metadata(details));
        }
        metadata.extend(self::metadata(invoice));

        let customer_email = str_field(invoice, "customer_email")
            .ok_or_else(|| BillingError::InvalidInput("invoice has no customer email".into()))?
            .to_string();

        let charge = match str_field(invoice, "billing_reason") {
            Some("subscription_create") | Some("subscription") => ChargeClassification::Initial,
            Some("subscription_cycle") | Some("subscription_update") | Some("subscription_threshold") => {
                ChargeClassification::Recurring
            }
            _ => ChargeClassification::OneOff,
        };

        Ok(Self {
            customer_email,
            portal_key: metadata.get("portal_key").cloned(),
            company_name: metadata
                .get("company_name")
                .cloned()
                .or_else(|| str_field(invoice, "customer_name").map(str::to_string))
                .unwrap_or_default(),
            billing_model: billing_model_from(&metadata)?,
            journey: metadata.get("journey").cloned(),
            stripe: StripeIds {
                customer_id: expandable_id(invoice, "customer"),
                subscription_id: expandable_id(invoice, "subscription"),
                subscription_item_id: lines
                    .iter()
                    .find_map(|line| expandable_id(line, "subscription_item")),
            },
            amount_cents: invoice.get("amount_paid").and_then(Value::as_i64),
            charge,
            reference: str_field(invoice, "id").unwrap_or_default().to_string(),
            origin: "stripe_invoice",
        })
    }
}

/// Operator-triggered activation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualActivation {
    pub customer_email: String,
    pub portal_key: Option<String>,
    pub company_name: String,
    pub billing_model: Option<BillingModel>,
    pub journey: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl From<ManualActivation> for ActivationCandidate {
    fn from(manual: ManualActivation) -> Self {
        Self {
            customer_email: manual.customer_email,
            portal_key: manual.portal_key,
            company_name: manual.company_name,
            billing_model: manual.billing_model,
            journey: manual.journey,
            stripe: StripeIds::default(),
            amount_cents: None,
            charge: ChargeClassification::Manual,
            reference: "manual".to_string(),
            origin: "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Activated,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationOutcome {
    pub status: ActivationStatus,
    pub reason: Option<&'static str>,
    pub portal_key: Option<String>,
    pub invitation_id: Option<String>,
    pub intent_status: Option<IntentStatus>,
}

impl ActivationOutcome {
    fn skipped(reason: &'static str, portal_key: Option<String>) -> Self {
        Self {
            status: ActivationStatus::Skipped,
            reason: Some(reason),
            portal_key,
            invitation_id: None,
            intent_status: None,
        }
    }
}

pub struct ActivationOrchestrator {
    store: Arc<dyn LedgerStore>,
    intents: Arc<LeadgenIntentStore>,
    profile: Arc<OrganizationBillingProfile>,
    invitations: Arc<dyn InvitationProvider>,
    notifier: Arc<dyn Notifier>,
    config: ActivationConfig,
    event_logger: BillingEventLogger,
}

impl ActivationOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        intents: Arc<LeadgenIntentStore>,
        profile: Arc<OrganizationBillingProfile>,
        invitations: Arc<dyn InvitationProvider>,
        notifier: Arc<dyn Notifier>,
        config: ActivationConfig,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            store,
            intents,
            profile,
            invitations,
            notifier,
            config,
            event_logger,
        }
    }

    /// Billing model from the candidate, or from the intent already on file
    async fn resolve_billing_model(
        &self,
        candidate: &ActivationCandidate,
    ) -> BillingResult<BillingModel> {
        if let Some(model) = candidate.billing_model {
            return Ok(model);
        }
        let existing = match candidate.portal_key.as_deref() {
            Some(key) => self.intents.find_by_portal_key(key).await?,
            None => {
                self.intents
                    .find_active(&candidate.customer_email, &candidate.company_name)
                    .await?
            }
        };
        existing.map(|intent| intent.billing_model).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "no billing model for payment {}",
                candidate.reference
            ))
        })
    }

    /// Activate the customer behind a confirmed payment
    ///
    /// Marking the intent paid and filling in Stripe ids run on every
    /// candidate so a later invoice can attach the subscription item; only
    /// the invitation is guarded by the idempotency check.
    pub async fn activate(
        &self,
        candidate: ActivationCandidate,
        force: bool,
    ) -> BillingResult<ActivationOutcome> {
        if candidate.charge == ChargeClassification::Recurring && !force {
            tracing::debug!(
                reference = %candidate.reference,
                "Recurring charge; activation skipped"
            );
            return Ok(ActivationOutcome::skipped(
                SKIPPED_RECURRING_CHARGE,
                candidate.portal_key,
            ));
        }

        let billing_model = self.resolve_billing_model(&candidate).await?;
        let intent = self
            .intents
            .mark_paid(PaymentConfirmation {
                portal_key: candidate.portal_key.clone(),
                company_name: candidate.company_name.clone(),
                billing_email: candidate.customer_email.clone(),
                billing_model,
                origin: candidate.origin.to_string(),
            })
            .await?;
        let org = self
            .profile
            .apply_billing_defaults(&intent, &candidate.stripe)
            .await?;

        if candidate.charge != ChargeClassification::Manual {
            let mut builder =
                BillingEventBuilder::new(&org.portal_key, BillingEventType::PaymentReceived)
                    .stripe_reference(&candidate.reference)
                    .data(serde_json::json!({
                        "charge": candidate.charge.as_str(),
                        "customer_email": candidate.customer_email,
                    }));
            if let Some(amount) = candidate.amount_cents {
                builder = builder.amount_cents(amount);
            }
            if let Err(e) = self.event_logger.log_event(builder).await {
                tracing::warn!(error = %e, "Failed to log payment received event");
            }
        }

        let existing = self
            .store
            .find_billing_customer(&candidate.customer_email)
            .await?;
        if let Some(previous) = existing.and_then(|c| c.invitation_id) {
            if !force {
                tracing::info!(
                    portal_key = %org.portal_key,
                    invitation_id = %previous,
                    "Invitation already sent; activation skipped"
                );
                return Ok(ActivationOutcome {
                    intent_status: Some(intent.status),
                    ..ActivationOutcome::skipped(SKIPPED_ALREADY_INVITED, Some(org.portal_key))
                });
            }

            self.invitations.revoke_invitation(&previous).await?;
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(&org.portal_key, BillingEventType::InvitationRevoked)
                        .data(serde_json::json!({ "invitation_id": previous })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log invitation revoked event");
            }
        }

        let payment_first = candidate.journey.as_deref() == Some(JOURNEY_PAYMENT_FIRST);
        let redirect_url = if payment_first {
            self.config.onboarding_url(&intent.token)
        } else {
            self.config.portal_url.clone()
        };

        let invitation_id = self
            .invitations
            .create_invitation(&InvitationRequest {
                email: candidate.customer_email.clone(),
                redirect_url: redirect_url.clone(),
                metadata: InvitationMetadata {
                    portal_key: org.portal_key.clone(),
                    company_name: org.company_name.clone(),
                    source: candidate.origin.to_string(),
                },
            })
            .await?;

        self.store
            .record_invitation(InvitationRecord {
                portal_key: org.portal_key.clone(),
                email: candidate.customer_email.clone(),
                stripe_customer_id: candidate.stripe.customer_id.clone(),
                invitation_id: invitation_id.clone(),
                sent_at: OffsetDateTime::now_utc(),
            })
            .await?;
        let intent = self.intents.mark_invited(&org.portal_key).await?;

        tracing::info!(
            portal_key = %org.portal_key,
            invitation_id = %invitation_id,
            payment_first = payment_first,
            forced = force,
            "Customer activated"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(&org.portal_key, BillingEventType::InvitationSent)
                    .data(serde_json::json!({
                        "invitation_id": invitation_id,
                        "payment_first": payment_first,
                        "forced": force,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invitation sent event");
        }

        let notice = ActivationNotice {
            portal_key: org.portal_key.clone(),
            company_name: org.company_name.clone(),
            customer_email: candidate.customer_email.clone(),
            billing_model: org.billing_model.to_string(),
            redirect_url,
            invitation_id: invitation_id.clone(),
            charge: candidate.charge.as_str().to_string(),
        };
        if let Err(e) = self.notifier.send_customer_welcome(&notice).await {
            tracing::warn!(portal_key = %org.portal_key, error = %e, "Failed to send welcome email");
        }
        if let Err(e) = self.notifier.send_ops_activation(&notice).await {
            tracing::warn!(portal_key = %org.portal_key, error = %e, "Failed to send ops activation email");
        }

        Ok(ActivationOutcome {
            status: ActivationStatus::Activated,
            reason: None,
            portal_key: Some(org.portal_key),
            invitation_id: Some(invitation_id),
            intent_status: Some(intent.status),
        })
    }
}

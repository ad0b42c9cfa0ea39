//! Organization billing profile
//!
//! Organizations are only minted from a paid leadgen intent. Counters start
//! from the billing model's defaults; later payment events can only fill in
//! Stripe identifiers, never reset counters.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::models::{BillingModel, LeadgenIntent, Organization, StripeIds};
use crate::store::{LedgerStore, NewOrganization};

/// Pricing applied to newly created organizations
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub lead_unit_price_cents: i64,
    /// Copied onto new organizations. Stripe enforces it through the usage
    /// threshold on the metered price; reported usage is never batched here.
    pub lead_charge_threshold: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lead_unit_price_cents: 0,
            lead_charge_threshold: 1,
        }
    }
}

pub struct OrganizationBillingProfile {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    event_logger: BillingEventLogger,
}

impl OrganizationBillingProfile {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            store,
            config,
            event_logger,
        }
    }

    pub async fn get(&self, portal_key: &str) -> BillingResult<Organization> {
        self.store
            .get_organization(portal_key)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("organization {}", portal_key)))
    }

    /// Create the organization for a paid intent, or attach Stripe ids to
    /// the existing one
    pub async fn apply_billing_defaults(
        &self,
        intent: &LeadgenIntent,
        stripe: &StripeIds,
    ) -> BillingResult<Organization> {
        let defaults = intent.billing_model.defaults();
        let (org, created) = self
            .store
            .create_organization_if_absent(NewOrganization {
                portal_key: intent.portal_key.clone(),
                company_name: intent.company_name.clone(),
                billing_model: intent.billing_model,
                prepaid_lead_credits: defaults.prepaid_lead_credits,
                lead_commitment_total: defaults.lead_commitment_total,
                lead_charge_threshold: self.config.lead_charge_threshold,
                lead_unit_price_cents: self.config.lead_unit_price_cents,
                stripe: stripe.clone(),
            })
            .await?;

        if created {
            tracing::info!(
                portal_key = %org.portal_key,
                billing_model = %org.billing_model,
                prepaid_lead_credits = org.prepaid_lead_credits,
                lead_commitment_total = org.lead_commitment_total,
                "Created organization with billing defaults"
            );
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(&org.portal_key, BillingEventType::BillingDefaultsApplied)
                        .data(serde_json::json!({
                            "billing_model": org.billing_model.as_str(),
                            "prepaid_lead_credits": org.prepaid_lead_credits,
                            "lead_commitment_total": org.lead_commitment_total,
                            "intent_id": intent.id,
                        })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log billing defaults event");
            }
            return Ok(org);
        }

        if org.billing_model != intent.billing_model {
            tracing::warn!(
                portal_key = %org.portal_key,
                organization_model = %org.billing_model,
                intent_model = %intent.billing_model,
                "Intent billing model differs from organization; leaving organization unchanged"
            );
        }

        if *stripe == StripeIds::default() {
            return Ok(org);
        }
        self.store.attach_stripe_ids(&org.portal_key, stripe).await
    }

    /// Switch billing model; requires `migration` once leads were billed
    pub async fn change_billing_model(
        &self,
        portal_key: &str,
        model: BillingModel,
        migration: bool,
    ) -> BillingResult<Organization> {
        let org = self
            .store
            .change_billing_model(portal_key, model, migration)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    portal_key = %portal_key,
                    billing_model = %model,
                    migration = migration,
                    error = %e,
                    "Billing model change refused"
                );
            })?;
        tracing::info!(
            portal_key = %portal_key,
            billing_model = %org.billing_model,
            migration = migration,
            "Billing model updated"
        );
        Ok(org)
    }

    /// Subscription item usage is reported against
    pub async fn subscription_item_for(&self, portal_key: &str) -> BillingResult<String> {
        self.get(portal_key)
            .await?
            .stripe_subscription_item_id
            .ok_or_else(|| {
                BillingError::MissingConfiguration(format!(
                    "no subscription item for organization {}",
                    portal_key
                ))
            })
    }
}

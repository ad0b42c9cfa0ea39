//! Leadgen intent lifecycle
//!
//! `checkout_created → paid → invited → onboarding_completed`. Every
//! transition is a forward-only compare-and-swap in the store; re-applying a
//! transition the intent already passed returns the record unchanged.

use std::sync::Arc;

use serde::Deserialize;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::models::{BillingModel, IntentStatus, LeadgenIntent};
use crate::store::{LedgerStore, NewIntent};

const DEFAULT_TOKEN_TTL_DAYS: i64 = 14;

#[derive(Debug, Clone)]
pub struct IntentConfig {
    /// How long an onboarding token stays valid after payment
    pub token_ttl: Duration,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::days(DEFAULT_TOKEN_TTL_DAYS),
        }
    }
}

/// A prospect starting checkout
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutIntentRequest {
    pub portal_key: Option<String>,
    pub company_name: String,
    pub billing_email: String,
    pub billing_model: BillingModel,
    pub source: Option<String>,
}

/// A confirmed payment, as seen by the intent store
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub portal_key: Option<String>,
    pub company_name: String,
    pub billing_email: String,
    pub billing_model: BillingModel,
    /// Where the payment came from, e.g. `stripe_checkout`
    pub origin: String,
}

/// 256-bit random token, hex encoded
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Derive a portal key from a company name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn validate_contact(company_name: &str, billing_email: &str) -> BillingResult<()> {
    if company_name.trim().is_empty() {
        return Err(BillingError::InvalidInput("companyName is required".into()));
    }
    let email = billing_email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(BillingError::InvalidInput(
            "billingEmail must be a valid email address".into(),
        )),
    }
}

fn resolve_portal_key(explicit: Option<&str>, company_name: &str) -> BillingResult<String> {
    let key = match explicit.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => key.to_string(),
        None => slugify(company_name),
    };
    if key.is_empty() {
        return Err(BillingError::InvalidInput(
            "could not derive a portal key from companyName".into(),
        ));
    }
    Ok(key)
}

pub struct LeadgenIntentStore {
    store: Arc<dyn LedgerStore>,
    config: IntentConfig,
}

impl LeadgenIntentStore {
    pub fn new(store: Arc<dyn LedgerStore>, config: IntentConfig) -> Self {
        Self { store, config }
    }

    /// Start checkout, reusing the active intent for (email, company)
    pub async fn create_checkout_intent(
        &self,
        request: CheckoutIntentRequest,
    ) -> BillingResult<LeadgenIntent> {
        validate_contact(&request.company_name, &request.billing_email)?;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = self
            .store
            .find_active_intent(&request.billing_email, &request.company_name, now)
            .await?
        {
            tracing::info!(
                portal_key = %existing.portal_key,
                intent_id = %existing.id,
                status = %existing.status,
                "Reusing active leadgen intent"
            );
            return Ok(existing);
        }

        let portal_key = resolve_portal_key(request.portal_key.as_deref(), &request.company_name)?;
        let intent = self
            .store
            .insert_intent(NewIntent {
                portal_key,
                company_name: request.company_name.trim().to_string(),
                billing_email: request.billing_email.trim().to_string(),
                billing_model: request.billing_model,
                token: generate_token(),
                token_expires_at: now + self.config.token_ttl,
                status: IntentStatus::CheckoutCreated,
                source: request.source.unwrap_or_else(|| "checkout".to_string()),
                created_at: now,
            })
            .await?;

        tracing::info!(
            portal_key = %intent.portal_key,
            intent_id = %intent.id,
            billing_model = %intent.billing_model,
            "Created checkout intent"
        );
        Ok(intent)
    }

    /// Onboarding-form lookup: token must be unexpired and at or past `paid`
    pub async fn find_by_token(&self, token: &str) -> BillingResult<LeadgenIntent> {
        let now = OffsetDateTime::now_utc();
        self.store
            .find_intent_by_token(token)
            .await?
            .filter(|intent| intent.token_is_live(now))
            .ok_or_else(|| BillingError::NotFound("onboarding link is invalid or expired".into()))
    }

    pub async fn find_by_portal_key(&self, portal_key: &str) -> BillingResult<Option<LeadgenIntent>> {
        self.store.find_intent_by_portal_key(portal_key).await
    }

    pub async fn find_active(
        &self,
        billing_email: &str,
        company_name: &str,
    ) -> BillingResult<Option<LeadgenIntent>> {
        self.store
            .find_active_intent(billing_email, company_name, OffsetDateTime::now_utc())
            .await
    }

    /// Move to `paid`, creating the intent if payment arrived first
    ///
    /// The onboarding token's expiry restarts from the payment time.
    pub async fn mark_paid(&self, payment: PaymentConfirmation) -> BillingResult<LeadgenIntent> {
        let now = OffsetDateTime::now_utc();

        let by_portal_key = match payment.portal_key.as_deref() {
            Some(key) => self.store.find_intent_by_portal_key(key).await?,
            None => None,
        };
        let existing = match by_portal_key {
            Some(intent) => Some(intent),
            None => {
                self.store
                    .find_active_intent(&payment.billing_email, &payment.company_name, now)
                    .await?
            }
        };

        let intent = match existing {
            Some(intent) => {
                self.store
                    .advance_intent(
                        intent.id,
                        IntentStatus::Paid,
                        now,
                        Some(now + self.config.token_ttl),
                    )
                    .await?
            }
            None => {
                validate_contact(&payment.company_name, &payment.billing_email)?;
                let portal_key =
                    resolve_portal_key(payment.portal_key.as_deref(), &payment.company_name)?;
                let created = self
                    .store
                    .insert_intent(NewIntent {
                        portal_key,
                        company_name: payment.company_name.trim().to_string(),
                        billing_email: payment.billing_email.trim().to_string(),
                        billing_model: payment.billing_model,
                        token: generate_token(),
                        token_expires_at: now + self.config.token_ttl,
                        status: IntentStatus::Paid,
                        source: format!("payment:{}", payment.origin),
                        created_at: now,
                    })
                    .await?;
                tracing::info!(
                    portal_key = %created.portal_key,
                    intent_id = %created.id,
                    origin = %payment.origin,
                    "Created leadgen intent from payment"
                );
                created
            }
        };

        tracing::info!(
            portal_key = %intent.portal_key,
            intent_id = %intent.id,
            status = %intent.status,
            "Leadgen intent marked paid"
        );
        Ok(intent)
    }

    pub async fn mark_invited(&self, portal_key: &str) -> BillingResult<LeadgenIntent> {
        self.advance_by_portal_key(portal_key, IntentStatus::Invited)
            .await
    }

    pub async fn mark_onboarding_completed(&self, portal_key: &str) -> BillingResult<LeadgenIntent> {
        self.advance_by_portal_key(portal_key, IntentStatus::OnboardingCompleted)
            .await
    }

    /// Finish onboarding from the token-scoped form
    pub async fn complete_onboarding_by_token(&self, token: &str) -> BillingResult<LeadgenIntent> {
        let intent = self.find_by_token(token).await?;
        let completed = self
            .store
            .advance_intent(
                intent.id,
                IntentStatus::OnboardingCompleted,
                OffsetDateTime::now_utc(),
                None,
            )
            .await?;
        tracing::info!(
            portal_key = %completed.portal_key,
            intent_id = %completed.id,
            "Onboarding completed"
        );
        Ok(completed)
    }

    async fn advance_by_portal_key(
        &self,
        portal_key: &str,
        target: IntentStatus,
    ) -> BillingResult<LeadgenIntent> {
        let intent = self
            .store
            .find_intent_by_portal_key(portal_key)
            .await?
            .ok_or_else(|| {
                tracing::error!(portal_key = %portal_key, target = %target, "No leadgen intent for portal key");
                BillingError::NotFound(format!("leadgen intent for {}", portal_key))
            })?;

        let advanced = self
            .store
            .advance_intent(intent.id, target, OffsetDateTime::now_utc(), None)
            .await?;
        if advanced.status == intent.status {
            tracing::debug!(
                portal_key = %portal_key,
                status = %advanced.status,
                target = %target,
                "Intent already at or past target"
            );
        }
        Ok(advanced)
    }
}

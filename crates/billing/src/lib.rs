// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lead Billing Ledger
//!
//! Turns delivered-lead notifications into exactly-once charges against a
//! contractor's account and tracks the surrounding billing lifecycle.
//!
//! ## Features
//!
//! - **Lead Event Ledger**: Dual-key idempotent recording with per-model billable quantities
//! - **Usage Metering**: Idempotent Stripe usage records for billable units
//! - **Leadgen Intents**: Forward-only `checkout_created → paid → invited → onboarding_completed`
//! - **Billing Profiles**: Organization defaults per billing model, guarded model migrations
//! - **Replacement Requests**: Policy auto-rejection plus single-shot human resolution
//! - **Activation**: Payment confirmation to portal invitation, once per customer
//! - **Webhooks**: Signature-verified, replay-protected Stripe payment events
//! - **Invariants**: Read-only consistency checks over the ledger tables

pub mod activation;
pub mod billable;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod intake;
pub mod intents;
pub mod invariants;
pub mod invitation;
pub mod ledger;
pub mod models;
pub mod organization;
pub mod policy;
pub mod replacement;
pub mod store;
pub mod usage;
pub mod webhooks;


// Activation
pub use activation::{
    ActivationCandidate, ActivationConfig, ActivationOrchestrator, ActivationOutcome,
    ActivationStatus, ChargeClassification, ManualActivation,
};

// Billable quantity
pub use billable::{decide_billable, BillingDecision, LedgerPosition};

// Client
pub use client::{StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig, Notifier, RecordingNotifier};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

// Intake
pub use intake::{normalize_delivery, payload_hash_key, PortalKeyResolver};

// Intents
pub use intents::{CheckoutIntentRequest, IntentConfig, LeadgenIntentStore, PaymentConfirmation};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invitations
pub use invitation::{
    HttpInvitationClient, InvitationConfig, InvitationProvider, RecordingInvitationProvider,
};

// Ledger
pub use ledger::{DeliveryReceipt, LeadEventLedger, UsageRetrySummary};

// Models
pub use models::{
    BillingCustomer, BillingEvent, BillingModel, IntentStatus, LeadEvent, LeadEventStatus,
    LeadgenIntent, Organization, PolicyChecks, ReplacementReason, ReplacementRequest,
    ReplacementStatus, StripeIds,
};

// Organization
pub use organization::{LedgerConfig, OrganizationBillingProfile};

// Policy
pub use policy::{ReasonRule, ReplacementPolicy};

// Replacement
pub use replacement::{
    ReplacementDecision, ReplacementRequestPolicyEngine, ReplacementSubmission,
    ResolutionDecision, ResolutionResult, ResolveReplacement,
};

// Store
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

// Usage
pub use usage::{InMemoryUsageReporter, StripeUsageBridge, UsageReporter};

// Webhooks
pub use webhooks::{PaymentEnvelope, PaymentWebhookHandler, WebhookOutcome};

use std::collections::HashMap;
use std::sync::Arc;

/// Everything the billing services are configured with
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    pub invitation: InvitationConfig,
    pub email: EmailConfig,
    pub activation: ActivationConfig,
    pub ledger: LedgerConfig,
    pub intents: IntentConfig,
    pub replacement_policy: ReplacementPolicy,
    /// Business name to portal key, for delivery payloads without a portal key
    pub business_portal_map: HashMap<String, String>,
}

/// Outbound collaborators; swapped for recording fakes in tests
#[derive(Clone)]
pub struct BillingCollaborators {
    pub usage: Arc<dyn UsageReporter>,
    pub invitations: Arc<dyn InvitationProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl BillingCollaborators {
    /// Stripe metering, the HTTP invitation client and Resend email
    pub fn live(config: &BillingConfig, stripe: &StripeClient) -> BillingResult<Self> {
        Ok(Self {
            usage: Arc::new(StripeUsageBridge::new(stripe.clone())),
            invitations: Arc::new(HttpInvitationClient::new(&config.invitation)?),
            notifier: Arc::new(BillingEmailService::new(config.email.clone())?),
        })
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn LedgerStore>,
    pub ledger: Arc<LeadEventLedger>,
    pub intents: Arc<LeadgenIntentStore>,
    pub organizations: Arc<OrganizationBillingProfile>,
    pub replacements: Arc<ReplacementRequestPolicyEngine>,
    pub activation: Arc<ActivationOrchestrator>,
    pub webhooks: Arc<PaymentWebhookHandler>,
}

impl BillingService {
    /// Create the billing service with live collaborators
    pub fn new(config: BillingConfig, store: Arc<dyn LedgerStore>) -> BillingResult<Self> {
        let stripe = StripeClient::new(config.stripe.clone());
        let collaborators = BillingCollaborators::live(&config, &stripe)?;
        Ok(Self::with_collaborators(config, store, stripe, collaborators))
    }

    /// Create the billing service with explicit collaborators
    pub fn with_collaborators(
        config: BillingConfig,
        store: Arc<dyn LedgerStore>,
        stripe: StripeClient,
        collaborators: BillingCollaborators,
    ) -> Self {
        let intents = Arc::new(LeadgenIntentStore::new(store.clone(), config.intents));
        let organizations = Arc::new(OrganizationBillingProfile::new(store.clone(), config.ledger));
        let activation = Arc::new(ActivationOrchestrator::new(
            store.clone(),
            intents.clone(),
            organizations.clone(),
            collaborators.invitations,
            collaborators.notifier,
            config.activation,
        ));

        Self {
            ledger: Arc::new(LeadEventLedger::new(
                store.clone(),
                collaborators.usage,
                PortalKeyResolver::new(config.business_portal_map),
            )),
            replacements: Arc::new(ReplacementRequestPolicyEngine::new(
                store.clone(),
                config.replacement_policy,
            )),
            webhooks: Arc::new(PaymentWebhookHandler::new(stripe, store.clone(), activation.clone())),
            intents,
            organizations,
            activation,
            store,
        }
    }
}

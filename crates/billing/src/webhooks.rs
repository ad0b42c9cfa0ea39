//! Stripe payment webhook handling
//!
//! Only checkout completion and paid invoices matter here; both feed the
//! activation orchestrator. Every handled event is claimed in the store
//! before processing so concurrent or replayed deliveries run it once.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use stripe::{Event, Webhook};
use time::OffsetDateTime;

use crate::activation::{ActivationCandidate, ActivationOrchestrator, ActivationOutcome};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::LedgerStore;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAID: &str = "invoice.paid";

/// The parts of a Stripe event this handler reads
#[derive(Debug, Clone)]
pub struct PaymentEnvelope {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub object: Value,
}

impl PaymentEnvelope {
    pub fn from_event(event: &Event) -> BillingResult<Self> {
        Ok(Self {
            id: event.id.to_string(),
            event_type: event.type_.to_string(),
            created: event.created,
            object: serde_json::to_value(&event.data.object)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub received: bool,
    pub handled: bool,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<ActivationOutcome>,
}

impl WebhookOutcome {
    fn ignored() -> Self {
        Self {
            received: true,
            handled: false,
            duplicate: false,
            activation: None,
        }
    }
}

/// Check a `Stripe-Signature` header against the raw payload
///
/// The header carries `t=<unix seconds>` and one or more `v1=<hex hmac>`
/// entries; any matching `v1` is accepted.
pub fn verify_signature(
    payload: &str,
    header: &str,
    webhook_secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let drift = (now.unix_timestamp() - timestamp).abs();
    if drift > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = timestamp, drift = drift, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // Stripe keys the HMAC with the whole secret, `whsec_` prefix included
    let signed_payload = format!("{}.{}", timestamp, payload);

    let verified = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    });

    if !verified {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

pub struct PaymentWebhookHandler {
    stripe: StripeClient,
    store: Arc<dyn LedgerStore>,
    activation: Arc<ActivationOrchestrator>,
}

impl PaymentWebhookHandler {
    pub fn new(
        stripe: StripeClient,
        store: Arc<dyn LedgerStore>,
        activation: Arc<ActivationOrchestrator>,
    ) -> Self {
        Self {
            stripe,
            store,
            activation,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// The library verifier rejects events from API versions it does not
    /// know, so a failure there falls back to manual HMAC verification.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature(payload, signature, webhook_secret, OffsetDateTime::now_utc())?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;
        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification passed"
        );
        Ok(event)
    }

    /// Verify, then process
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_envelope(PaymentEnvelope::from_event(&event)?).await
    }

    /// Claim, dispatch and record the result of one event
    pub async fn handle_envelope(&self, envelope: PaymentEnvelope) -> BillingResult<WebhookOutcome> {
        if envelope.event_type != CHECKOUT_SESSION_COMPLETED && envelope.event_type != INVOICE_PAID {
            tracing::debug!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Ignoring payment webhook event type"
            );
            return Ok(WebhookOutcome::ignored());
        }

        let event_timestamp = OffsetDateTime::from_unix_timestamp(envelope.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let claimed = self
            .store
            .claim_webhook_event(&envelope.id, &envelope.event_type, event_timestamp)
            .await?;
        if !claimed {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Duplicate payment webhook event; already claimed"
            );
            return Ok(WebhookOutcome {
                received: true,
                handled: true,
                duplicate: true,
                activation: None,
            });
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Processing payment webhook event"
        );
        let result = self.process(&envelope).await;

        let (processing_result, error_message) = match &result {
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .finish_webhook_event(&envelope.id, processing_result, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %envelope.id,
                processing_result = processing_result,
                error = %e,
                "Failed to record webhook processing result; event stays claimed until stale"
            );
        }

        let activation = result?;
        Ok(WebhookOutcome {
            received: true,
            handled: true,
            duplicate: false,
            activation,
        })
    }

    async fn process(&self, envelope: &PaymentEnvelope) -> BillingResult<Option<ActivationOutcome>> {
        let candidate = match envelope.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => {
                let payment_status = envelope
                    .object
                    .get("payment_status")
                    .and_then(Value::as_str);
                if payment_status == Some("unpaid") {
                    tracing::info!(
                        event_id = %envelope.id,
                        "Checkout completed without payment; waiting for invoice"
                    );
                    return Ok(None);
                }
                ActivationCandidate::from_checkout_session(&envelope.object)?
            }
            INVOICE_PAID => ActivationCandidate::from_invoice(&envelope.object)?,
            other => return Err(BillingError::WebhookEventNotSupported(other.to_string())),
        };

        let outcome = self.activation.activate(candidate, false).await?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationConfig, ActivationStatus};
    use crate::client::StripeConfig;
    use crate::email::RecordingNotifier;
    use crate::intents::{IntentConfig, LeadgenIntentStore};
    use crate::invitation::RecordingInvitationProvider;
    use crate::organization::{LedgerConfig, OrganizationBillingProfile};
    use crate::store::MemoryLedgerStore;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn handler() -> (PaymentWebhookHandler, Arc<MemoryLedgerStore>, RecordingInvitationProvider) {
        let store = Arc::new(MemoryLedgerStore::new());
        let invitations = RecordingInvitationProvider::new();
        let activation = ActivationOrchestrator::new(
            store.clone(),
            Arc::new(LeadgenIntentStore::new(store.clone(), IntentConfig::default())),
            Arc::new(OrganizationBillingProfile::new(store.clone(), LedgerConfig::default())),
            Arc::new(invitations.clone()),
            Arc::new(RecordingNotifier::new()),
            ActivationConfig {
                portal_url: "https://portal.leadgen.test".into(),
                onboarding_base_url: "https://leadgen.test/onboarding".into(),
            },
        );
        let stripe = StripeClient::new(StripeConfig {
            secret_key: "sk_test_123".into(),
            webhook_secret: SECRET.into(),
        });
        (
            PaymentWebhookHandler::new(stripe, store.clone(), Arc::new(activation)),
            store,
            invitations,
        )
    }

    fn checkout_envelope(id: &str) -> PaymentEnvelope {
        PaymentEnvelope {
            id: id.into(),
            event_type: CHECKOUT_SESSION_COMPLETED.into(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            object: json!({
                "id": "cs_test_1",
                "customer": "cus_1",
                "customer_email": "ann@acme.test",
                "payment_status": "paid",
                "metadata": {
                    "portal_key": "acme-roofing",
                    "company_name": "Acme Roofing",
                    "billing_model": "pay_per_lead_perpetual"
                }
            }),
        }
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc();
        let header = sign(payload, now.unix_timestamp());
        verify_signature(payload, &header, SECRET, now).unwrap();

        // Extra signatures from a rolled secret are tolerated
        let rolled = format!("{},v1=deadbeef", header);
        verify_signature(payload, &rolled, SECRET, now).unwrap();
    }

    #[test]
    fn test_signature_keyed_by_stripped_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc();
        let mut mac = HmacSha256::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{}.{}", now.unix_timestamp(), payload).as_bytes());
        let header = format!(
            "t={},v1={}",
            now.unix_timestamp(),
            hex::encode(mac.finalize().into_bytes())
        );
        let err = verify_signature(payload, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign(r#"{"id":"evt_1"}"#, now.unix_timestamp());
        let err = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = OffsetDateTime::now_utc();
        let header = sign(payload, now.unix_timestamp() - 301);
        assert!(verify_signature(payload, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let now = OffsetDateTime::now_utc();
        assert!(verify_signature("{}", "garbage", SECRET, now).is_err());
        assert!(verify_signature("{}", "t=123", SECRET, now).is_err());
        assert!(verify_signature("{}", "v1=abcd", SECRET, now).is_err());
    }

    #[test]
    fn test_verify_event_rejects_bad_signature() {
        let (handler, _, _) = handler();
        let err = handler.verify_event("{}", "t=1,v1=00").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn test_checkout_completed_activates_once() {
        let (handler, store, invitations) = handler();

        let first = handler.handle_envelope(checkout_envelope("evt_1")).await.unwrap();
        assert!(first.handled);
        assert!(!first.duplicate);
        assert_eq!(
            first.activation.map(|a| a.status),
            Some(ActivationStatus::Activated)
        );

        let replay = handler.handle_envelope(checkout_envelope("evt_1")).await.unwrap();
        assert!(replay.duplicate);
        assert_eq!(invitations.created().len(), 1);
        assert!(store.get_organization("acme-roofing").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_event_types_not_handled() {
        let (handler, _, _) = handler();
        let mut envelope = checkout_envelope("evt_2");
        envelope.event_type = "customer.subscription.updated".into();
        let outcome = handler.handle_envelope(envelope).await.unwrap();
        assert!(outcome.received);
        assert!(!outcome.handled);
    }

    #[tokio::test]
    async fn test_failed_event_can_be_retried() {
        let (handler, _, invitations) = handler();
        invitations.fail_create(true);
        assert!(handler.handle_envelope(checkout_envelope("evt_3")).await.is_err());

        invitations.fail_create(false);
        let retry = handler.handle_envelope(checkout_envelope("evt_3")).await.unwrap();
        assert!(!retry.duplicate);
        assert_eq!(invitations.created().len(), 1);
    }

    #[tokio::test]
    async fn test_unpaid_checkout_waits_for_invoice() {
        let (handler, store, _) = handler();
        let mut envelope = checkout_envelope("evt_4");
        envelope.object["payment_status"] = json!("unpaid");
        let outcome = handler.handle_envelope(envelope).await.unwrap();
        assert!(outcome.handled);
        assert!(outcome.activation.is_none());
        assert!(store.get_organization("acme-roofing").await.unwrap().is_none());
    }
}

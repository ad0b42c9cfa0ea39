//! Router fixtures backed by the in-memory ledger store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use leadgen_billing::{
    store::NewOrganization, ActivationConfig, BillingCollaborators, BillingConfig, BillingModel,
    BillingService, EmailConfig, InMemoryUsageReporter, IntentConfig, InvitationConfig,
    LedgerConfig, MemoryLedgerStore, RecordingInvitationProvider, RecordingNotifier,
    ReplacementPolicy, StripeClient, StripeConfig, StripeIds,
};
use leadgen_shared::DedupCache;
use serde_json::Value;
use tower::ServiceExt;

use crate::{config::ApiTokens, routes::create_router, state::AppState};

pub const LEAD_TOKEN: &str = "lead-token";
pub const REPLACEMENT_TOKEN: &str = "replacement-token";
pub const ADMIN_TOKEN: &str = "admin-token";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryLedgerStore>,
    pub usage: InMemoryUsageReporter,
    pub invitations: RecordingInvitationProvider,
}

fn billing_config() -> BillingConfig {
    BillingConfig {
        stripe: StripeConfig {
            secret_key: "sk_test_123".into(),
            webhook_secret: WEBHOOK_SECRET.into(),
        },
        invitation: InvitationConfig {
            api_url: "http://invitations.invalid".into(),
            api_key: "inv_key".into(),
        },
        email: EmailConfig::default(),
        activation: ActivationConfig {
            portal_url: "https://portal.test".into(),
            onboarding_base_url: "https://portal.test/onboarding".into(),
        },
        ledger: LedgerConfig::default(),
        intents: IntentConfig::default(),
        replacement_policy: ReplacementPolicy::default(),
        business_portal_map: HashMap::new(),
    }
}

pub async fn test_app() -> TestApp {
    let store = Arc::new(MemoryLedgerStore::new());
    store
        .seed_organization(NewOrganization {
            portal_key: "acme-roofing".into(),
            company_name: "Acme Roofing".into(),
            billing_model: BillingModel::PayPerLeadPerpetual,
            prepaid_lead_credits: 0,
            lead_commitment_total: 0,
            lead_charge_threshold: 1,
            lead_unit_price_cents: 4500,
            stripe: StripeIds {
                customer_id: Some("cus_acme".into()),
                subscription_id: Some("sub_acme".into()),
                subscription_item_id: Some("si_acme".into()),
            },
        })
        .await;

    let usage = InMemoryUsageReporter::new();
    let invitations = RecordingInvitationProvider::new();
    let config = billing_config();
    let stripe = StripeClient::new(config.stripe.clone());
    let billing = BillingService::with_collaborators(
        config,
        store.clone(),
        stripe,
        BillingCollaborators {
            usage: Arc::new(usage.clone()),
            invitations: Arc::new(invitations.clone()),
            notifier: Arc::new(RecordingNotifier::new()),
        },
    );

    let state = AppState::new(
        Arc::new(billing),
        DedupCache::new_in_memory(Duration::from_secs(300)),
        ApiTokens {
            lead_webhook: LEAD_TOKEN.into(),
            replacement: REPLACEMENT_TOKEN.into(),
            admin: ADMIN_TOKEN.into(),
        },
    );

    TestApp {
        router: create_router(state),
        store,
        usage,
        invitations,
    }
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response: Response<Body> = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

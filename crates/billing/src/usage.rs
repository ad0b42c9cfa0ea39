//! Metered usage reporting
//!
//! Billable lead quantities are pushed to Stripe as incremental usage
//! records. Every call carries an idempotency key derived from the ledger's
//! own key, so Stripe is the arbiter of whether a charge already happened
//! and a retried call after a lost response cannot double-report.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{
    CreateUsageRecord, RequestStrategy, SubscriptionItemId, UsageRecord, UsageRecordAction,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Idempotency key sent with the usage call for a ledger entry
pub fn usage_idempotency_key(portal_key: &str, idempotency_key: &str) -> String {
    format!("lead-usage:{}:{}", portal_key, idempotency_key)
}

/// One usage increment against a subscription item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub subscription_item_id: String,
    pub quantity: i64,
    pub timestamp: OffsetDateTime,
    pub idempotency_key: String,
}

/// Outbound metered-billing call
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// Returns the provider's usage record id
    async fn report_usage(&self, report: &UsageReport) -> BillingResult<String>;
}

/// Reports usage through the Stripe usage-records API
pub struct StripeUsageBridge {
    stripe: StripeClient,
}

impl StripeUsageBridge {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl UsageReporter for StripeUsageBridge {
    async fn report_usage(&self, report: &UsageReport) -> BillingResult<String> {
        let item_id: SubscriptionItemId = report.subscription_item_id.parse().map_err(|_| {
            BillingError::MissingConfiguration(format!(
                "invalid subscription item id {}",
                report.subscription_item_id
            ))
        })?;
        let quantity = u64::try_from(report.quantity).map_err(|_| {
            BillingError::InvalidInput(format!("usage quantity {} out of range", report.quantity))
        })?;

        let client = self
            .stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(report.idempotency_key.clone()));

        let record = UsageRecord::create(
            &client,
            &item_id,
            CreateUsageRecord {
                quantity,
                timestamp: Some(report.timestamp.unix_timestamp()),
                action: Some(UsageRecordAction::Increment),
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(
                subscription_item_id = %report.subscription_item_id,
                idempotency_key = %report.idempotency_key,
                error = %e,
                "Stripe usage record call failed"
            );
            BillingError::StripeApi(e.to_string())
        })?;

        tracing::info!(
            subscription_item_id = %report.subscription_item_id,
            quantity = report.quantity,
            usage_record_id = %record.id,
            "Reported metered lead usage"
        );
        Ok(record.id.to_string())
    }
}

/// Usage reporter that keeps calls in memory and honors idempotency keys
/// the way Stripe does: a repeated key returns the original record id.
#[derive(Clone, Default)]
pub struct InMemoryUsageReporter {
    inner: Arc<Mutex<InMemoryUsage>>,
}

#[derive(Default)]
struct InMemoryUsage {
    calls: Vec<UsageReport>,
    records: HashMap<String, String>,
    failures_remaining: usize,
}

impl InMemoryUsageReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with an upstream error
    pub async fn fail_next(&self, count: usize) {
        self.inner.lock().await.failures_remaining = count;
    }

    /// Every call received, including replays of the same key
    pub async fn calls(&self) -> Vec<UsageReport> {
        self.inner.lock().await.calls.clone()
    }

    /// Distinct usage records created
    pub async fn records_created(&self) -> usize {
        self.inner.lock().await.records.len()
    }
}

#[async_trait]
impl UsageReporter for InMemoryUsageReporter {
    async fn report_usage(&self, report: &UsageReport) -> BillingResult<String> {
        let mut state = self.inner.lock().await;
        state.calls.push(report.clone());
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BillingError::StripeApi("simulated usage failure".into()));
        }
        let next_id = format!("mbur_{}", state.records.len() + 1);
        Ok(state
            .records
            .entry(report.idempotency_key.clone())
            .or_insert(next_id)
            .clone())
    }
}

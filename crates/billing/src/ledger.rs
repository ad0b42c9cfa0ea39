//! Lead event ledger
//!
//! Records each delivered lead exactly once and reports billable units to
//! the usage bridge. A replayed delivery returns the stored decision with
//! `duplicate: true`. The only outbound call a replay can make is finishing
//! a usage report that never got its record id persisted, and that call
//! reuses the original idempotency key.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::intake::{normalize_delivery, PortalKeyResolver};
use crate::models::{LeadEvent, LeadEventStatus};
use crate::store::LedgerStore;
use crate::usage::{usage_idempotency_key, UsageReport, UsageReporter};

/// Response to a delivery webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub success: bool,
    pub duplicate: bool,
    pub idempotency_key: String,
    pub portal_key: String,
    pub source_external_id: String,
    pub lead_event_id: Uuid,
    pub billable_quantity: i64,
    pub billing_skipped_reason: Option<String>,
}

impl DeliveryReceipt {
    fn from_event(event: &LeadEvent, duplicate: bool) -> Self {
        Self {
            success: true,
            duplicate,
            idempotency_key: event.idempotency_key.clone(),
            portal_key: event.portal_key.clone(),
            source_external_id: event.source_external_id.clone(),
            lead_event_id: event.id,
            billable_quantity: event.billable_quantity,
            billing_skipped_reason: event.billing_skipped_reason.clone(),
        }
    }
}

/// Outcome of a usage reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageRetrySummary {
    pub attempted: usize,
    pub reported: usize,
    pub failed: usize,
}

pub struct LeadEventLedger {
    store: Arc<dyn LedgerStore>,
    usage: Arc<dyn UsageReporter>,
    event_logger: BillingEventLogger,
    resolver: PortalKeyResolver,
}

impl LeadEventLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        usage: Arc<dyn UsageReporter>,
        resolver: PortalKeyResolver,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            store,
            usage,
            event_logger,
            resolver,
        }
    }

    /// Record a delivery notification and report its billable units
    pub async fn record_delivery(&self, payload: &serde_json::Value) -> BillingResult<DeliveryReceipt> {
        let delivery = normalize_delivery(payload, &self.resolver, OffsetDateTime::now_utc())?;
        let recorded = self.store.record_lead_event(delivery).await?;
        let event = recorded.event;

        if recorded.duplicate {
            tracing::info!(
                portal_key = %event.portal_key,
                lead_event_id = %event.id,
                idempotency_key = %event.idempotency_key,
                "Duplicate lead delivery, returning recorded result"
            );
        } else {
            tracing::info!(
                portal_key = %event.portal_key,
                lead_event_id = %event.id,
                quantity = event.quantity,
                billable_quantity = event.billable_quantity,
                credits_consumed = event.credits_consumed,
                skipped_reason = ?event.billing_skipped_reason,
                "Recorded lead delivery"
            );
        }

        if needs_usage_report(&event) {
            self.report_usage(&event).await?;
        }

        Ok(DeliveryReceipt::from_event(&event, recorded.duplicate))
    }

    /// Report an event's billable quantity and persist the usage record id
    ///
    /// Fails with `MissingConfiguration` when the organization has no
    /// subscription item; the bill is never dropped silently.
    pub async fn report_usage(&self, event: &LeadEvent) -> BillingResult<String> {
        let org = self
            .store
            .get_organization(&event.portal_key)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("organization {}", event.portal_key)))?;

        let subscription_item_id = org.stripe_subscription_item_id.ok_or_else(|| {
            tracing::error!(
                portal_key = %event.portal_key,
                lead_event_id = %event.id,
                billable_quantity = event.billable_quantity,
                "No Stripe subscription item for billable lead"
            );
            BillingError::MissingConfiguration(format!(
                "no subscription item for organization {}",
                event.portal_key
            ))
        })?;

        let report = UsageReport {
            subscription_item_id,
            quantity: event.billable_quantity,
            timestamp: event.delivered_at,
            idempotency_key: usage_idempotency_key(&event.portal_key, &event.idempotency_key),
        };

        let usage_record_id = match self.usage.report_usage(&report).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(log_err) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(&event.portal_key, BillingEventType::UsageReportFailed)
                            .lead_event(event.id)
                            .data(serde_json::json!({
                                "quantity": event.billable_quantity,
                                "error": e.to_string(),
                            })),
                    )
                    .await
                {
                    tracing::warn!(error = %log_err, "Failed to log usage failure event");
                }
                return Err(e);
            }
        };

        let stored = self
            .store
            .set_usage_record_id(event.id, &usage_record_id, OffsetDateTime::now_utc())
            .await?;

        if stored {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(&event.portal_key, BillingEventType::UsageReported)
                        .lead_event(event.id)
                        .stripe_reference(&usage_record_id)
                        .amount_cents(event.billable_quantity * org.lead_unit_price_cents)
                        .data(serde_json::json!({ "quantity": event.billable_quantity })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log usage reported event");
            }
        }

        Ok(usage_record_id)
    }

    /// Re-report billable events whose usage record id never got persisted
    pub async fn retry_unreported_usage(
        &self,
        grace: Duration,
        limit: i64,
    ) -> BillingResult<UsageRetrySummary> {
        let cutoff = OffsetDateTime::now_utc() - grace;
        let pending = self.store.list_unreported_usage(cutoff, limit).await?;
        let mut summary = UsageRetrySummary::default();

        for event in pending {
            summary.attempted += 1;
            match self.report_usage(&event).await {
                Ok(_) => summary.reported += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        portal_key = %event.portal_key,
                        lead_event_id = %event.id,
                        error = %e,
                        "Usage retry failed"
                    );
                }
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                reported = summary.reported,
                failed = summary.failed,
                "Usage reconciliation pass finished"
            );
        }
        Ok(summary)
    }

    /// Administrative `delivered → invalid`
    pub async fn invalidate_lead_event(
        &self,
        lead_event_id: Uuid,
        actor: &str,
    ) -> BillingResult<LeadEvent> {
        let event = self.store.invalidate_lead_event(lead_event_id).await?;
        tracing::info!(
            portal_key = %event.portal_key,
            lead_event_id = %event.id,
            actor = %actor,
            "Lead event invalidated"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(&event.portal_key, BillingEventType::LeadInvalidated)
                    .lead_event(event.id)
                    .data(serde_json::json!({ "actor": actor })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log lead invalidation event");
        }
        Ok(event)
    }
}

fn needs_usage_report(event: &LeadEvent) -> bool {
    event.billable_quantity > 0
        && event.stripe_usage_record_id.is_none()
        && event.status == LeadEventStatus::Delivered
}

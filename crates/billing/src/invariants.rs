//! Ledger invariant checks
//!
//! Read-only consistency checks over the lead billing tables. The worker
//! runs them daily and operators can run them on demand after a replay or
//! manual fix.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Billable leads get this long to carry a usage record before it counts as missed
const USAGE_REPORT_GRACE_MINUTES: i32 = 60;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Portal key(s) affected
    pub portal_keys: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is being charged or credited incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeCounterRow {
    portal_key: String,
    prepaid_lead_credits: i64,
    lead_commitment_total: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnbackedCreditRow {
    lead_event_id: Uuid,
    portal_key: String,
    source_external_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PolicyStatusRow {
    request_id: Uuid,
    portal_key: String,
    status: String,
    within_one_week: bool,
    contacted_within_15m: bool,
    reason_eligible: bool,
    lead_status_eligible: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct UnreportedUsageRow {
    lead_event_id: Uuid,
    portal_key: String,
    billable_quantity: i64,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct InvitedWithoutTimestampRow {
    intent_id: Uuid,
    portal_key: String,
    status: String,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_non_negative_counters().await?);
        violations.extend(self.check_credited_leads_have_approval().await?);
        violations.extend(self.check_auto_rejected_has_failed_check().await?);
        violations.extend(self.check_submitted_passed_all_checks().await?);
        violations.extend(self.check_billable_usage_reported().await?);
        violations.extend(self.check_invited_intents_have_timestamp().await?);

        let summary = InvariantCheckSummary::from_violations(now, violations);
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Ledger invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    portal_keys = ?violation.portal_keys,
                    description = %violation.description,
                    "Ledger invariant violated"
                );
            }
        }
        Ok(summary)
    }

    /// Invariant 1: Credit and commitment counters never go negative
    async fn check_non_negative_counters(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeCounterRow> = sqlx::query_as(
            r#"
            SELECT portal_key, prepaid_lead_credits, lead_commitment_total
            FROM organizations
            WHERE prepaid_lead_credits < 0 OR lead_commitment_total < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_counters".to_string(),
                description: format!(
                    "Organization '{}' has negative counters (credits {}, commitment {})",
                    row.portal_key, row.prepaid_lead_credits, row.lead_commitment_total
                ),
                context: serde_json::json!({
                    "prepaid_lead_credits": row.prepaid_lead_credits,
                    "lead_commitment_total": row.lead_commitment_total,
                }),
                portal_keys: vec![row.portal_key],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: A credited lead is backed by an approved replacement
    async fn check_credited_leads_have_approval(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnbackedCreditRow> = sqlx::query_as(
            r#"
            SELECT e.id AS lead_event_id, e.portal_key, e.source_external_id
            FROM lead_events e
            WHERE e.status = 'credited'
              AND NOT EXISTS (
                  SELECT 1 FROM lead_replacement_requests r
                  WHERE r.lead_event_id = e.id AND r.status = 'approved'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credited_lead_has_approval".to_string(),
                description: format!(
                    "Lead {} ({}) is credited without an approved replacement request",
                    row.lead_event_id, row.source_external_id
                ),
                context: serde_json::json!({
                    "lead_event_id": row.lead_event_id,
                    "source_external_id": row.source_external_id,
                }),
                portal_keys: vec![row.portal_key],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn policy_status_rows(&self, condition: &str) -> BillingResult<Vec<PolicyStatusRow>> {
        let query = format!(
            r#"
            SELECT id AS request_id, portal_key, status, within_one_week,
                   contacted_within_15m, reason_eligible, lead_status_eligible
            FROM lead_replacement_requests
            WHERE {}
            "#,
            condition
        );
        Ok(sqlx::query_as(&query).fetch_all(&self.pool).await?)
    }

    fn policy_violation(invariant: &str, description: &str, row: PolicyStatusRow) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            description: format!("Replacement request {} {}", row.request_id, description),
            context: serde_json::json!({
                "request_id": row.request_id,
                "status": row.status,
                "withinOneWeek": row.within_one_week,
                "contactedWithin15m": row.contacted_within_15m,
                "reasonEligible": row.reason_eligible,
                "leadStatusEligible": row.lead_status_eligible,
            }),
            portal_keys: vec![row.portal_key],
            severity: ViolationSeverity::High,
        }
    }

    /// Invariant 3: Auto-rejected requests failed at least one policy check
    async fn check_auto_rejected_has_failed_check(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .policy_status_rows(
                "status = 'auto_rejected_policy' \
                 AND within_one_week AND contacted_within_15m \
                 AND reason_eligible AND lead_status_eligible",
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                Self::policy_violation(
                    "auto_rejected_has_failed_check",
                    "was auto-rejected although every policy check passed",
                    row,
                )
            })
            .collect())
    }

    /// Invariant 4: Requests queued for review passed every policy check
    ///
    /// Resolved requests are included since they were queued first.
    async fn check_submitted_passed_all_checks(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .policy_status_rows(
                "status IN ('submitted', 'approved', 'rejected') \
                 AND NOT (within_one_week AND contacted_within_15m \
                          AND reason_eligible AND lead_status_eligible)",
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                Self::policy_violation(
                    "reviewed_request_passed_policy",
                    "reached review despite a failed policy check",
                    row,
                )
            })
            .collect())
    }

    /// Invariant 5: Billable deliveries carry a usage record once past the grace period
    async fn check_billable_usage_reported(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnreportedUsageRow> = sqlx::query_as(
            r#"
            SELECT id AS lead_event_id, portal_key, billable_quantity, created_at
            FROM lead_events
            WHERE status = 'delivered'
              AND billable_quantity > 0
              AND stripe_usage_record_id IS NULL
              AND created_at < NOW() - make_interval(mins => $1)
            ORDER BY created_at
            "#,
        )
        .bind(USAGE_REPORT_GRACE_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "billable_usage_reported".to_string(),
                description: format!(
                    "Lead {} has {} billable unit(s) and no usage record since {}",
                    row.lead_event_id, row.billable_quantity, row.created_at
                ),
                context: serde_json::json!({
                    "lead_event_id": row.lead_event_id,
                    "billable_quantity": row.billable_quantity,
                }),
                portal_keys: vec![row.portal_key],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: Invited intents record when the invitation went out
    async fn check_invited_intents_have_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvitedWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT id AS intent_id, portal_key, status
            FROM leadgen_intents
            WHERE status = 'invited' AND invited_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invited_intent_has_timestamp".to_string(),
                description: format!("Intent {} is invited but has no invited_at", row.intent_id),
                context: serde_json::json!({
                    "intent_id": row.intent_id,
                    "status": row.status,
                }),
                portal_keys: vec![row.portal_key],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "non_negative_counters" => self.check_non_negative_counters().await,
            "credited_lead_has_approval" => self.check_credited_leads_have_approval().await,
            "auto_rejected_has_failed_check" => self.check_auto_rejected_has_failed_check().await,
            "reviewed_request_passed_policy" => self.check_submitted_passed_all_checks().await,
            "billable_usage_reported" => self.check_billable_usage_reported().await,
            "invited_intent_has_timestamp" => self.check_invited_intents_have_timestamp().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "non_negative_counters",
            "credited_lead_has_approval",
            "auto_rejected_has_failed_check",
            "reviewed_request_passed_policy",
            "billable_usage_reported",
            "invited_intent_has_timestamp",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"credited_lead_has_approval"));
        assert!(checks.contains(&"billable_usage_reported"));
    }

    #[test]
    fn test_summary_counts_failed_invariants_once() {
        let violation = |name: &str| InvariantViolation {
            invariant: name.to_string(),
            portal_keys: vec!["acme-roofing".into()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        };
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            vec![
                violation("billable_usage_reported"),
                violation("billable_usage_reported"),
                violation("non_negative_counters"),
            ],
        );
        assert_eq!(summary.checks_run, 6);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 6);
    }
}

//! Replacement request policy
//!
//! Four independent checks are computed and stored verbatim. Any failure
//! auto-rejects the request; otherwise it waits for a human. Which reasons
//! hinge on response time, and which always need review, is policy data
//! loaded from configuration rather than code.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::models::{LeadEvent, LeadEventStatus, PolicyChecks, ReplacementReason, ReplacementStatus};

const DEFAULT_REVIEW_WINDOW_DAYS: i64 = 7;
const DEFAULT_CONTACT_WINDOW_MINUTES: i64 = 15;

/// Rules for one replacement reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonRule {
    /// Reason can be granted at all
    pub eligible: bool,
    /// Contractor must have attempted contact within the contact window
    pub requires_timely_contact: bool,
    /// Always routed to a human, flagged on the request
    pub mandatory_review: bool,
}

impl ReasonRule {
    fn default_for(reason: ReplacementReason) -> Self {
        match reason {
            ReplacementReason::NeverAnswered => ReasonRule {
                eligible: true,
                requires_timely_contact: true,
                mandatory_review: false,
            },
            ReplacementReason::OtherQualityIssue => ReasonRule {
                eligible: true,
                requires_timely_contact: false,
                mandatory_review: true,
            },
            ReplacementReason::WrongNumber
            | ReplacementReason::DuplicateLead
            | ReplacementReason::OutsideServiceArea
            | ReplacementReason::ServiceNotOffered
            | ReplacementReason::SpamOrFake => ReasonRule {
                eligible: true,
                requires_timely_contact: false,
                mandatory_review: false,
            },
        }
    }
}

/// Configurable replacement policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplacementPolicy {
    pub review_window_days: i64,
    pub contact_window_minutes: i64,
    /// Overrides per reason; reasons left out use the built-in rule
    pub reasons: BTreeMap<ReplacementReason, ReasonRule>,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self {
            review_window_days: DEFAULT_REVIEW_WINDOW_DAYS,
            contact_window_minutes: DEFAULT_CONTACT_WINDOW_MINUTES,
            reasons: ReplacementReason::ALL
                .into_iter()
                .map(|reason| (reason, ReasonRule::default_for(reason)))
                .collect(),
        }
    }
}

/// What the policy decided for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEvaluation {
    pub checks: PolicyChecks,
    pub mandatory_review: bool,
    pub status: ReplacementStatus,
}

impl PolicyEvaluation {
    pub fn eligible_for_review(&self) -> bool {
        self.status == ReplacementStatus::Submitted
    }

    /// Contractor-facing summary
    pub fn message(&self) -> String {
        if self.eligible_for_review() {
            if self.mandatory_review {
                "Replacement request submitted and flagged for manual review".to_string()
            } else {
                "Replacement request submitted for review".to_string()
            }
        } else {
            format!(
                "Replacement request automatically rejected: failed {}",
                self.checks.failed_checks().join(", ")
            )
        }
    }
}

impl ReplacementPolicy {
    pub fn rule(&self, reason: ReplacementReason) -> ReasonRule {
        self.reasons
            .get(&reason)
            .copied()
            .unwrap_or_else(|| ReasonRule::default_for(reason))
    }

    /// Evaluate a dispute against the lead as it stands now
    ///
    /// `already_disputed` is true when the lead has a request that is still
    /// waiting for review or was approved; a lead is disputed at most once.
    pub fn evaluate(
        &self,
        lead: &LeadEvent,
        already_disputed: bool,
        reason: ReplacementReason,
        requested_at: OffsetDateTime,
        contact_attempted_at: Option<OffsetDateTime>,
    ) -> PolicyEvaluation {
        let rule = self.rule(reason);

        let within_one_week =
            requested_at - lead.delivered_at <= Duration::days(self.review_window_days);

        let contacted_within_15m = if rule.requires_timely_contact {
            contact_attempted_at.is_some_and(|at| {
                let elapsed = at - lead.delivered_at;
                elapsed >= Duration::ZERO
                    && elapsed <= Duration::minutes(self.contact_window_minutes)
            })
        } else {
            true
        };

        let checks = PolicyChecks {
            within_one_week,
            contacted_within_15m,
            reason_eligible: rule.eligible,
            lead_status_eligible: lead.status == LeadEventStatus::Delivered && !already_disputed,
        };

        let status = if checks.all_passed() {
            ReplacementStatus::Submitted
        } else {
            ReplacementStatus::AutoRejectedPolicy
        };

        PolicyEvaluation {
            checks,
            mandatory_review: rule.mandatory_review,
            status,
        }
    }
}

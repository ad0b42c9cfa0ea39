//! Billable-quantity decision
//!
//! One exhaustive match per billing model. The store calls this inside the
//! same transaction that locks the organization row, so the inputs are the
//! counters as they stand at insert time.

use crate::models::BillingModel;

/// Reason recorded when prepaid credits cover a delivery
pub const SKIPPED_PREPAID_OR_COMMITMENT: &str = "prepaid_or_commitment";

/// Reason recorded for the free qualifying lead
pub const SKIPPED_FIRST_LEAD_FREE: &str = "first_lead_free";

/// Outcome of deciding how much of a delivery is charged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingDecision {
    /// Units reported to the usage bridge
    pub billable_quantity: i64,
    /// Prepaid credits drawn down by this delivery
    pub credits_consumed: i64,
    pub skipped_reason: Option<&'static str>,
}

/// Organization counters as they stand when a delivery is recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerPosition {
    pub prepaid_credits: i64,
    /// Units the commitment covers in total, credits included
    pub commitment_total: i64,
    /// Units already delivered without a charge, not counting credited leads
    pub covered_units: i64,
    /// Lead events already recorded, regardless of their later status
    pub prior_deliveries: i64,
}

/// Decide billable units for a delivery of `quantity` units
pub fn decide_billable(model: BillingModel, position: LedgerPosition, quantity: i64) -> BillingDecision {
    let quantity = quantity.max(0);
    let from_credits = quantity.min(position.prepaid_credits.max(0));

    match model {
        BillingModel::Package40PaidInFull => BillingDecision {
            billable_quantity: quantity - from_credits,
            credits_consumed: from_credits,
            skipped_reason: (from_credits > 0).then_some(SKIPPED_PREPAID_OR_COMMITMENT),
        },
        BillingModel::Commitment40With10Upfront => {
            // Units past the upfront credits are invoiced with the commitment,
            // not metered, until the commitment is used up
            let headroom =
                (position.commitment_total - position.covered_units - from_credits).max(0);
            let from_commitment = (quantity - from_credits).min(headroom);
            let covered = from_credits + from_commitment;
            BillingDecision {
                billable_quantity: quantity - covered,
                credits_consumed: from_credits,
                skipped_reason: (covered > 0).then_some(SKIPPED_PREPAID_OR_COMMITMENT),
            }
        }
        BillingModel::PayPerLeadPerpetual => BillingDecision {
            billable_quantity: quantity,
            credits_consumed: 0,
            skipped_reason: None,
        },
        BillingModel::PayPerLead40FirstLead => {
            let free = if position.prior_deliveries == 0 {
                quantity.min(1)
            } else {
                0
            };
            BillingDecision {
                billable_quantity: quantity - free,
                credits_consumed: 0,
                skipped_reason: (free > 0).then_some(SKIPPED_FIRST_LEAD_FREE),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credits(prepaid_credits: i64, prior_deliveries: i64) -> LedgerPosition {
        LedgerPosition {
            prepaid_credits,
            commitment_total: 40,
            covered_units: prior_deliveries,
            prior_deliveries,
        }
    }

    #[test]
    fn test_prepaid_exhaustion_sequence() {
        let mut remaining = 2;
        let mut billed = Vec::new();
        for prior in 0..3 {
            let decision =
                decide_billable(BillingModel::Package40PaidInFull, credits(remaining, prior), 1);
            remaining -= decision.credits_consumed;
            billed.push(decision.billable_quantity);
        }
        assert_eq!(billed, vec![0, 0, 1]);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_partial_credit_coverage_splits_quantity() {
        let decision = decide_billable(BillingModel::Package40PaidInFull, credits(1, 9), 3);
        assert_eq!(decision.credits_consumed, 1);
        assert_eq!(decision.billable_quantity, 2);
        assert_eq!(decision.skipped_reason, Some(SKIPPED_PREPAID_OR_COMMITMENT));
    }

    #[test]
    fn test_exhausted_credits_bill_everything_without_reason() {
        let decision = decide_billable(BillingModel::Package40PaidInFull, credits(0, 40), 1);
        assert_eq!(
            decision,
            BillingDecision {
                billable_quantity: 1,
                credits_consumed: 0,
                skipped_reason: None,
            }
        );
    }

    #[test]
    fn test_commitment_covers_leads_past_upfront_credits() {
        let mut position = LedgerPosition {
            prepaid_credits: 10,
            commitment_total: 40,
            covered_units: 0,
            prior_deliveries: 0,
        };
        let mut billed = Vec::new();
        for _ in 0..41 {
            let decision = decide_billable(BillingModel::Commitment40With10Upfront, position, 1);
            position.prepaid_credits -= decision.credits_consumed;
            position.covered_units += 1 - decision.billable_quantity;
            position.prior_deliveries += 1;
            billed.push(decision);
        }

        assert_eq!(billed[9].credits_consumed, 1);
        // Lead 11: credits gone, commitment still covers it
        assert_eq!(billed[10].credits_consumed, 0);
        assert_eq!(billed[10].billable_quantity, 0);
        assert_eq!(billed[10].skipped_reason, Some(SKIPPED_PREPAID_OR_COMMITMENT));
        assert_eq!(billed[39].billable_quantity, 0);
        assert_eq!(billed[40].billable_quantity, 1);
        assert_eq!(billed[40].skipped_reason, None);
        assert_eq!(position.prepaid_credits, 0);
    }

    #[test]
    fn test_commitment_splits_batch_at_the_cap() {
        let position = LedgerPosition {
            prepaid_credits: 0,
            commitment_total: 40,
            covered_units: 38,
            prior_deliveries: 38,
        };
        let decision = decide_billable(BillingModel::Commitment40With10Upfront, position, 5);
        assert_eq!(decision.billable_quantity, 3);
        assert_eq!(decision.credits_consumed, 0);
    }

    #[test]
    fn test_package_ignores_commitment_headroom() {
        let decision = decide_billable(BillingModel::Package40PaidInFull, credits(0, 2), 1);
        assert_eq!(decision.billable_quantity, 1);
    }

    #[test]
    fn test_perpetual_bills_every_unit_and_ignores_credits() {
        let decision = decide_billable(BillingModel::PayPerLeadPerpetual, credits(5, 0), 2);
        assert_eq!(decision.billable_quantity, 2);
        assert_eq!(decision.credits_consumed, 0);
        assert_eq!(decision.skipped_reason, None);
    }

    #[test]
    fn test_first_lead_free_only_once() {
        let first = decide_billable(BillingModel::PayPerLead40FirstLead, credits(0, 0), 1);
        assert_eq!(first.billable_quantity, 0);
        assert_eq!(first.skipped_reason, Some(SKIPPED_FIRST_LEAD_FREE));

        let second = decide_billable(BillingModel::PayPerLead40FirstLead, credits(0, 1), 1);
        assert_eq!(second.billable_quantity, 1);
        assert_eq!(second.skipped_reason, None);

        let batch = decide_billable(BillingModel::PayPerLead40FirstLead, credits(0, 0), 3);
        assert_eq!(batch.billable_quantity, 2);
    }
}

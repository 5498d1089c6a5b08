use chrono::NaiveDate;

use super::model::{
    derive_status, BillingObligation, ObligationDraft, ObligationStatus, AMOUNT_EPSILON,
};
use crate::error::AppError;

/// Decisions produced by [`plan_upsert`], to be executed inside the
/// store's per-tenant transaction.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    /// Periods with no existing obligation; inserted as pending.
    pub inserts: Vec<BillingObligation>,
    /// Existing untouched-by-payments periods whose lease terms changed.
    pub corrections: Vec<AmountCorrection>,
}

#[derive(Debug, Clone)]
pub struct AmountCorrection {
    pub obligation_id: String,
    pub amount: f64,
    pub due_date: NaiveDate,
}

/// Merge generator output against existing obligations.
///
/// Never touches payment progress: an existing period keeps its
/// `paid_amount`/`status`/`paid_date` no matter what; its amount and due
/// date may be corrected only while nothing has been paid against it.
pub fn plan_upsert(existing: &[BillingObligation], candidates: &[ObligationDraft]) -> UpsertPlan {
    let mut plan = UpsertPlan {
        inserts: Vec::new(),
        corrections: Vec::new(),
    };

    for candidate in candidates {
        let current = existing.iter().find(|obligation| {
            obligation.tenant_id == candidate.tenant_id && obligation.period == candidate.period
        });

        match current {
            None => plan.inserts.push(BillingObligation {
                id: uuid::Uuid::new_v4().to_string(),
                organization_id: candidate.organization_id.clone(),
                tenant_id: candidate.tenant_id.clone(),
                unit_id: candidate.unit_id.clone(),
                period: candidate.period,
                amount: candidate.amount,
                due_date: candidate.due_date,
                status: ObligationStatus::Pending,
                paid_amount: 0.0,
                paid_date: None,
            }),
            Some(obligation) => {
                // A period with payments is frozen against term changes.
                if obligation.paid_amount > AMOUNT_EPSILON {
                    continue;
                }
                let amount_changed =
                    (obligation.amount - candidate.amount).abs() > AMOUNT_EPSILON;
                let due_changed = obligation.due_date != candidate.due_date;
                if amount_changed || due_changed {
                    plan.corrections.push(AmountCorrection {
                        obligation_id: obligation.id.clone(),
                        amount: candidate.amount,
                        due_date: candidate.due_date,
                    });
                }
            }
        }
    }

    plan
}

#[derive(Debug, Clone, Copy)]
pub struct PaymentOutcome {
    pub previous_status: ObligationStatus,
    pub status: ObligationStatus,
    pub paid_amount: f64,
    pub remaining: f64,
}

/// Apply one payment to an obligation in place.
///
/// Payments are additive; once an obligation is paid its status never
/// regresses, whatever the reference date says. `paid_date` is set by
/// the first payment and advanced (never moved backward) whenever a
/// payment promotes the status toward paid.
pub fn apply_payment(
    obligation: &mut BillingObligation,
    amount: f64,
    paid_date: NaiveDate,
    today: NaiveDate,
) -> Result<PaymentOutcome, AppError> {
    if amount <= 0.0 {
        return Err(AppError::BadRequest(
            "Payment amount must be greater than zero.".to_string(),
        ));
    }

    let previous_status = obligation.status;
    obligation.paid_amount += amount;

    let derived = derive_status(
        obligation.amount,
        obligation.paid_amount,
        obligation.due_date,
        today,
    );
    obligation.status = if previous_status == ObligationStatus::Paid {
        ObligationStatus::Paid
    } else {
        derived
    };

    let promoted = promotion_rank(obligation.status) > promotion_rank(previous_status);
    obligation.paid_date = match obligation.paid_date {
        None => Some(paid_date),
        Some(existing) if promoted => Some(existing.max(paid_date)),
        other => other,
    };

    Ok(PaymentOutcome {
        previous_status,
        status: obligation.status,
        paid_amount: obligation.paid_amount,
        remaining: (obligation.amount - obligation.paid_amount).max(0.0),
    })
}

fn promotion_rank(status: ObligationStatus) -> u8 {
    match status {
        ObligationStatus::Pending | ObligationStatus::Overdue => 0,
        ObligationStatus::Partial => 1,
        ObligationStatus::Paid => 2,
    }
}

/// `max(0, billed - paid)` across a tenant's obligations. Overpaid
/// periods push the sum down but the result never goes negative.
pub fn outstanding_balance(obligations: &[BillingObligation]) -> f64 {
    let billed: f64 = obligations.iter().map(|o| o.amount).sum();
    let paid: f64 = obligations.iter().map(|o| o.paid_amount).sum();
    (billed - paid).max(0.0)
}

/// Whether the overdue sweep should transition this obligation.
pub fn sweep_applies(obligation: &BillingObligation, reference: NaiveDate) -> bool {
    matches!(
        obligation.status,
        ObligationStatus::Pending | ObligationStatus::Partial
    ) && obligation.due_date < reference
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::model::BillingPeriod;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn obligation(period: &str, amount: f64) -> BillingObligation {
        let period: BillingPeriod = period.parse().unwrap();
        BillingObligation {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: None,
            tenant_id: "tenant-1".to_string(),
            unit_id: "unit-1".to_string(),
            period,
            amount,
            due_date: period.due_date(15),
            status: ObligationStatus::Pending,
            paid_amount: 0.0,
            paid_date: None,
        }
    }

    fn draft(period: &str, amount: f64) -> ObligationDraft {
        let period: BillingPeriod = period.parse().unwrap();
        ObligationDraft {
            tenant_id: "tenant-1".to_string(),
            unit_id: "unit-1".to_string(),
            organization_id: None,
            period,
            amount,
            due_date: period.due_date(15),
        }
    }

    #[test]
    fn plan_inserts_only_missing_periods() {
        let existing = vec![obligation("2024-01", 1200.0)];
        let candidates = vec![draft("2024-01", 1200.0), draft("2024-02", 1200.0)];

        let plan = plan_upsert(&existing, &candidates);
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].period.to_string(), "2024-02");
        assert_eq!(plan.inserts[0].status, ObligationStatus::Pending);
        assert!(plan.corrections.is_empty());
    }

    #[test]
    fn replanning_after_execution_is_a_no_op() {
        let candidates = vec![draft("2024-01", 1200.0), draft("2024-02", 1200.0)];
        let first = plan_upsert(&[], &candidates);
        assert_eq!(first.inserts.len(), 2);

        let second = plan_upsert(&first.inserts, &candidates);
        assert!(second.inserts.is_empty());
        assert!(second.corrections.is_empty());
    }

    #[test]
    fn unpaid_periods_pick_up_lease_term_changes() {
        let existing = vec![obligation("2024-01", 1200.0)];
        let plan = plan_upsert(&existing, &[draft("2024-01", 1350.0)]);
        assert!(plan.inserts.is_empty());
        assert_eq!(plan.corrections.len(), 1);
        assert_eq!(plan.corrections[0].amount, 1350.0);
    }

    #[test]
    fn paid_periods_are_frozen_against_term_changes() {
        let mut paid = obligation("2024-01", 1200.0);
        paid.paid_amount = 400.0;
        paid.status = ObligationStatus::Partial;

        let plan = plan_upsert(&[paid], &[draft("2024-01", 1350.0)]);
        assert!(plan.inserts.is_empty());
        assert!(plan.corrections.is_empty());
    }

    #[test]
    fn partial_then_full_payment() {
        let mut obligation = obligation("2024-02", 1200.0);
        let today = date(2024, 2, 10);

        let outcome =
            apply_payment(&mut obligation, 500.0, date(2024, 2, 10), today).unwrap();
        assert_eq!(outcome.status, ObligationStatus::Partial);
        assert_eq!(obligation.paid_amount, 500.0);
        assert_eq!(obligation.paid_date, Some(date(2024, 2, 10)));

        let outcome =
            apply_payment(&mut obligation, 700.0, date(2024, 2, 20), date(2024, 2, 20)).unwrap();
        assert_eq!(outcome.status, ObligationStatus::Paid);
        assert_eq!(obligation.paid_amount, 1200.0);
        assert_eq!(obligation.paid_date, Some(date(2024, 2, 20)));
        assert_eq!(outcome.remaining, 0.0);
    }

    #[test]
    fn zero_or_negative_payments_are_rejected_unapplied() {
        let mut obligation = obligation("2024-02", 1200.0);
        let today = date(2024, 2, 10);
        assert!(apply_payment(&mut obligation, 0.0, today, today).is_err());
        assert!(apply_payment(&mut obligation, -50.0, today, today).is_err());
        assert_eq!(obligation.paid_amount, 0.0);
        assert_eq!(obligation.status, ObligationStatus::Pending);
    }

    #[test]
    fn paid_never_regresses() {
        let mut obligation = obligation("2024-02", 1200.0);
        let today = date(2024, 2, 10);
        apply_payment(&mut obligation, 1200.0, today, today).unwrap();
        assert_eq!(obligation.status, ObligationStatus::Paid);

        // Further top-ups past the due date stay paid.
        let later = date(2024, 4, 1);
        let outcome = apply_payment(&mut obligation, 25.0, later, later).unwrap();
        assert_eq!(outcome.status, ObligationStatus::Paid);
        assert_eq!(obligation.paid_amount, 1225.0);
    }

    #[test]
    fn top_ups_without_promotion_keep_the_paid_date() {
        let mut obligation = obligation("2024-02", 1200.0);
        apply_payment(&mut obligation, 100.0, date(2024, 2, 1), date(2024, 2, 1)).unwrap();
        assert_eq!(obligation.paid_date, Some(date(2024, 2, 1)));

        // Still partial afterwards — no promotion, date unchanged.
        apply_payment(&mut obligation, 100.0, date(2024, 2, 5), date(2024, 2, 5)).unwrap();
        assert_eq!(obligation.status, ObligationStatus::Partial);
        assert_eq!(obligation.paid_date, Some(date(2024, 2, 1)));

        // The promoting payment advances it.
        apply_payment(&mut obligation, 1000.0, date(2024, 2, 9), date(2024, 2, 9)).unwrap();
        assert_eq!(obligation.status, ObligationStatus::Paid);
        assert_eq!(obligation.paid_date, Some(date(2024, 2, 9)));
    }

    #[test]
    fn overdue_obligations_can_still_be_paid_off() {
        let mut obligation = obligation("2024-01", 1200.0);
        obligation.status = ObligationStatus::Overdue;

        let late = date(2024, 3, 5);
        let outcome = apply_payment(&mut obligation, 1200.0, late, late).unwrap();
        assert_eq!(outcome.previous_status, ObligationStatus::Overdue);
        assert_eq!(outcome.status, ObligationStatus::Paid);
    }

    #[test]
    fn balance_floors_at_zero_under_overpayment() {
        let mut a = obligation("2024-01", 1200.0);
        a.paid_amount = 1500.0;
        let b = obligation("2024-02", 100.0);

        // 1300 billed, 1500 paid -> floored
        assert_eq!(outstanding_balance(&[a.clone(), b]), 0.0);
        assert_eq!(outstanding_balance(&[a]), 0.0);
        assert_eq!(outstanding_balance(&[]), 0.0);
    }

    #[test]
    fn balance_counts_unpaid_amounts() {
        let mut january = obligation("2024-01", 1200.0);
        january.paid_amount = 500.0;
        let february = obligation("2024-02", 1200.0);
        assert_eq!(outstanding_balance(&[january, february]), 1900.0);
    }

    #[test]
    fn sweep_targets_unpaid_past_due_only() {
        let reference = date(2024, 2, 1);

        let pending = obligation("2024-01", 1200.0);
        assert!(sweep_applies(&pending, reference));

        let mut partial = obligation("2024-01", 1200.0);
        partial.paid_amount = 300.0;
        partial.status = ObligationStatus::Partial;
        assert!(sweep_applies(&partial, reference));

        let mut paid = obligation("2024-01", 1200.0);
        paid.paid_amount = 1200.0;
        paid.status = ObligationStatus::Paid;
        assert!(!sweep_applies(&paid, reference));

        let future = obligation("2024-03", 1200.0);
        assert!(!sweep_applies(&future, reference));

        let mut overdue = obligation("2024-01", 1200.0);
        overdue.status = ObligationStatus::Overdue;
        assert!(!sweep_applies(&overdue, reference));
    }
}

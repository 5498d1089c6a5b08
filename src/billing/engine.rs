use chrono::NaiveDate;

use super::generator::generate_obligations;
use super::model::{BillingObligation, LeaseTerm};
use super::reconcile::{outstanding_balance, PaymentOutcome};
use super::store::{BillingStore, MergeOutcome, PaymentTarget};
use crate::error::AppError;

/// Counters from one generation pass, for logging and API responses.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BillingCycleRun {
    pub leases_scanned: u32,
    pub created: u32,
    pub corrected: u32,
    pub errors: u32,
}

/// Generate and persist obligations for a single lease.
pub async fn upsert_lease_obligations<S: BillingStore>(
    store: &S,
    lease: &LeaseTerm,
    as_of: NaiveDate,
    backfill_months: u32,
) -> Result<MergeOutcome, AppError> {
    let candidates: Vec<_> = generate_obligations(lease, as_of, backfill_months).collect();
    if candidates.is_empty() {
        return Ok(MergeOutcome::default());
    }
    store.merge_obligations(&lease.tenant_id, &candidates).await
}

/// One full generation pass over every active lease.
///
/// Safe to re-run at any time: the merge keeps exactly one obligation
/// per (tenant, period) and never clobbers payment progress. Per-lease
/// failures are counted and logged, not propagated, so one bad lease
/// cannot starve the rest of the pass.
pub async fn run_billing_cycle<S: BillingStore>(
    store: &S,
    org_id: Option<&str>,
    as_of: NaiveDate,
    backfill_months: u32,
) -> Result<BillingCycleRun, AppError> {
    let leases = store.active_lease_terms(org_id).await?;

    let mut run = BillingCycleRun::default();
    for lease in &leases {
        run.leases_scanned += 1;
        match upsert_lease_obligations(store, lease, as_of, backfill_months).await {
            Ok(outcome) => {
                run.created += outcome.created.len() as u32;
                run.corrected += outcome.corrected;
            }
            Err(error) => {
                tracing::warn!(
                    lease_id = %lease.id,
                    tenant_id = %lease.tenant_id,
                    error = %error,
                    "Obligation upsert failed for lease"
                );
                run.errors += 1;
            }
        }
    }
    Ok(run)
}

/// Mark unpaid, past-due obligations overdue. Returns the transitioned
/// set so the caller can queue notifications.
pub async fn sweep_overdue<S: BillingStore>(
    store: &S,
    reference: NaiveDate,
) -> Result<Vec<BillingObligation>, AppError> {
    store.sweep_due(reference).await
}

/// Record a payment against a billing period or a specific obligation.
pub async fn record_payment<S: BillingStore>(
    store: &S,
    tenant_id: &str,
    target: &PaymentTarget,
    amount: f64,
    paid_date: NaiveDate,
    today: NaiveDate,
) -> Result<(BillingObligation, PaymentOutcome), AppError> {
    if amount <= 0.0 {
        return Err(AppError::BadRequest(
            "Payment amount must be greater than zero.".to_string(),
        ));
    }
    if tenant_id.trim().is_empty() {
        return Err(AppError::BadRequest("tenant_id is required.".to_string()));
    }
    store
        .record_payment(tenant_id, target, amount, paid_date, today)
        .await
}

/// How much a tenant currently owes. A tenant with no billing history
/// owes zero; that is a normal state, not an error.
pub async fn tenant_outstanding_balance<S: BillingStore>(
    store: &S,
    tenant_id: &str,
) -> Result<f64, AppError> {
    let obligations = store.obligations_for_tenant(tenant_id).await?;
    Ok(outstanding_balance(&obligations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::generator::DEFAULT_BACKFILL_MONTHS;
    use crate::billing::model::{derive_status, LeaseStatus, ObligationStatus};
    use crate::billing::store::memory::MemoryBillingStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn active_lease(tenant_id: &str, start: NaiveDate, monthly_amount: f64) -> LeaseTerm {
        LeaseTerm {
            id: format!("lease-{tenant_id}"),
            organization_id: Some("org-1".to_string()),
            tenant_id: tenant_id.to_string(),
            unit_id: "unit-1".to_string(),
            lease_start: Some(start),
            lease_end: None,
            activated_on: start,
            monthly_amount,
            status: LeaseStatus::Active,
        }
    }

    async fn seeded_store() -> MemoryBillingStore {
        let store = MemoryBillingStore::default();
        store
            .add_lease(active_lease("tenant-1", date(2024, 1, 15), 1200.0))
            .await;
        store
    }

    #[tokio::test]
    async fn cycle_creates_one_obligation_per_elapsed_month() {
        let store = seeded_store().await;
        let run = run_billing_cycle(&store, None, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        assert_eq!(run.leases_scanned, 1);
        assert_eq!(run.created, 3);
        assert_eq!(run.errors, 0);

        let obligations = store.obligations_for_tenant("tenant-1").await.unwrap();
        assert_eq!(obligations.len(), 3);
        assert!(obligations
            .iter()
            .all(|o| o.status == ObligationStatus::Pending && o.amount == 1200.0));
    }

    #[tokio::test]
    async fn rerunning_the_cycle_creates_nothing_new() {
        let store = seeded_store().await;
        let as_of = date(2024, 3, 20);

        let first = run_billing_cycle(&store, None, as_of, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        assert_eq!(first.created, 3);

        // Overlapping cron runs hit the same entry point with the same
        // date; the second run must be a no-op.
        let second = run_billing_cycle(&store, None, as_of, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.corrected, 0);

        let obligations = store.obligations_for_tenant("tenant-1").await.unwrap();
        assert_eq!(obligations.len(), 3);
    }

    #[tokio::test]
    async fn rerun_preserves_payment_progress() {
        let store = seeded_store().await;
        let as_of = date(2024, 3, 20);
        run_billing_cycle(&store, None, as_of, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2024-02"),
            500.0,
            date(2024, 2, 10),
            date(2024, 2, 10),
        )
        .await
        .unwrap();

        run_billing_cycle(&store, None, as_of, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        let obligations = store.obligations_for_tenant("tenant-1").await.unwrap();
        let february = obligations
            .iter()
            .find(|o| o.period.to_string() == "2024-02")
            .unwrap();
        assert_eq!(february.paid_amount, 500.0);
        assert_eq!(february.status, ObligationStatus::Partial);
    }

    #[tokio::test]
    async fn partial_then_full_payment_through_the_engine() {
        let store = seeded_store().await;
        run_billing_cycle(&store, None, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        let target = PaymentTarget::parse("2024-02");
        let (obligation, outcome) = record_payment(
            &store,
            "tenant-1",
            &target,
            500.0,
            date(2024, 2, 10),
            date(2024, 2, 10),
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, ObligationStatus::Partial);
        assert_eq!(obligation.paid_amount, 500.0);

        let (obligation, outcome) = record_payment(
            &store,
            "tenant-1",
            &target,
            700.0,
            date(2024, 2, 20),
            date(2024, 2, 20),
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, ObligationStatus::Paid);
        assert_eq!(obligation.paid_amount, 1200.0);
        assert_eq!(obligation.paid_date, Some(date(2024, 2, 20)));
    }

    #[tokio::test]
    async fn balance_shrinks_with_payments_and_grows_with_generation() {
        let store = seeded_store().await;
        run_billing_cycle(&store, None, date(2024, 2, 20), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        assert_eq!(
            tenant_outstanding_balance(&store, "tenant-1").await.unwrap(),
            2400.0
        );

        record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2024-01"),
            1200.0,
            date(2024, 1, 20),
            date(2024, 1, 20),
        )
        .await
        .unwrap();
        assert_eq!(
            tenant_outstanding_balance(&store, "tenant-1").await.unwrap(),
            1200.0
        );

        // Next month's run adds March.
        run_billing_cycle(&store, None, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        assert_eq!(
            tenant_outstanding_balance(&store, "tenant-1").await.unwrap(),
            2400.0
        );
    }

    #[tokio::test]
    async fn balance_never_goes_negative() {
        let store = seeded_store().await;
        run_billing_cycle(&store, None, date(2024, 1, 20), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        // Overpay January by a wide margin.
        record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2024-01"),
            5000.0,
            date(2024, 1, 20),
            date(2024, 1, 20),
        )
        .await
        .unwrap();

        assert_eq!(
            tenant_outstanding_balance(&store, "tenant-1").await.unwrap(),
            0.0
        );
    }

    #[tokio::test]
    async fn unknown_tenants_have_zero_balance_and_no_history() {
        let store = seeded_store().await;
        assert_eq!(
            tenant_outstanding_balance(&store, "nobody").await.unwrap(),
            0.0
        );
        assert!(store.obligations_for_tenant("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_marks_past_due_and_is_idempotent() {
        let store = seeded_store().await;
        run_billing_cycle(&store, None, date(2024, 1, 20), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        let transitioned = sweep_overdue(&store, date(2024, 2, 1)).await.unwrap();
        assert_eq!(transitioned.len(), 1);
        assert_eq!(transitioned[0].status, ObligationStatus::Overdue);
        assert_eq!(transitioned[0].paid_amount, 0.0);

        // Re-sweeping later transitions nothing further.
        let again = sweep_overdue(&store, date(2024, 3, 1)).await.unwrap();
        assert!(again.is_empty());

        let obligations = store.obligations_for_tenant("tenant-1").await.unwrap();
        assert_eq!(obligations[0].status, ObligationStatus::Overdue);
    }

    #[tokio::test]
    async fn stored_status_always_matches_the_derivation_rule() {
        let store = seeded_store().await;
        let today = date(2024, 3, 20);
        run_billing_cycle(&store, None, today, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        sweep_overdue(&store, today).await.unwrap();
        record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2024-03"),
            400.0,
            date(2024, 3, 18),
            today,
        )
        .await
        .unwrap();
        record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2024-01"),
            1200.0,
            date(2024, 3, 19),
            today,
        )
        .await
        .unwrap();

        for obligation in store.all_obligations().await {
            assert_eq!(
                obligation.status,
                derive_status(
                    obligation.amount,
                    obligation.paid_amount,
                    obligation.due_date,
                    today
                ),
                "status drifted for period {}",
                obligation.period
            );
        }
    }

    #[tokio::test]
    async fn rejects_nonpositive_amounts_and_missing_targets() {
        let store = seeded_store().await;
        run_billing_cycle(&store, None, date(2024, 2, 1), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        let target = PaymentTarget::parse("2024-01");
        let err = record_payment(&store, "tenant-1", &target, 0.0, date(2024, 2, 1), date(2024, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2031-01"),
            100.0,
            date(2024, 2, 1),
            date(2024, 2, 1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn amount_corrections_apply_only_to_untouched_periods() {
        let store = seeded_store().await;
        let as_of = date(2024, 2, 20);
        run_billing_cycle(&store, None, as_of, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();

        // Pay January, then raise the rent on the lease.
        record_payment(
            &store,
            "tenant-1",
            &PaymentTarget::parse("2024-01"),
            1200.0,
            date(2024, 1, 20),
            date(2024, 1, 20),
        )
        .await
        .unwrap();

        let raised = active_lease("tenant-1", date(2024, 1, 15), 1400.0);
        let outcome = upsert_lease_obligations(&store, &raised, as_of, DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.corrected, 1);

        let obligations = store.obligations_for_tenant("tenant-1").await.unwrap();
        let january = obligations
            .iter()
            .find(|o| o.period.to_string() == "2024-01")
            .unwrap();
        let february = obligations
            .iter()
            .find(|o| o.period.to_string() == "2024-02")
            .unwrap();
        assert_eq!(january.amount, 1200.0, "paid period must stay frozen");
        assert_eq!(february.amount, 1400.0, "unpaid period picks up new terms");
    }

    #[tokio::test]
    async fn tenants_are_processed_independently() {
        let store = seeded_store().await;
        store
            .add_lease(active_lease("tenant-2", date(2024, 2, 1), 900.0))
            .await;

        let run = run_billing_cycle(&store, None, date(2024, 3, 10), DEFAULT_BACKFILL_MONTHS)
            .await
            .unwrap();
        assert_eq!(run.leases_scanned, 2);
        assert_eq!(run.created, 5); // 3 for tenant-1, 2 for tenant-2

        assert_eq!(
            tenant_outstanding_balance(&store, "tenant-2").await.unwrap(),
            1800.0
        );
        assert_eq!(
            tenant_outstanding_balance(&store, "tenant-1").await.unwrap(),
            3600.0
        );
    }
}

use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::PgPool;

use super::model::{
    BillingObligation, BillingPeriod, LeaseTerm, ObligationDraft, ObligationStatus,
    AMOUNT_EPSILON,
};
use super::reconcile::{apply_payment, plan_upsert, PaymentOutcome};
use super::retry::{run_with_retry, RetryPolicy};
use crate::error::{map_sqlx_error, AppError};

/// What a payment is aimed at: a billing period ("2024-02") or a
/// specific obligation id.
#[derive(Debug, Clone)]
pub enum PaymentTarget {
    Period(BillingPeriod),
    Obligation(String),
}

impl PaymentTarget {
    /// Period-shaped strings become period targets; anything else is
    /// treated as an obligation id.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<BillingPeriod>() {
            Ok(period) => Self::Period(period),
            Err(_) => Self::Obligation(raw.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub created: Vec<BillingObligation>,
    pub corrected: u32,
}

/// The single persistence interface the billing core depends on.
///
/// Implementations must serialize mutations per tenant and are expected
/// to be idempotent: merging the same candidates or sweeping with the
/// same reference date twice leaves the same end state.
pub trait BillingStore {
    async fn active_lease_terms(&self, org_id: Option<&str>)
        -> Result<Vec<LeaseTerm>, AppError>;

    async fn lease_for_tenant(&self, tenant_id: &str) -> Result<Option<LeaseTerm>, AppError>;

    async fn obligations_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<BillingObligation>, AppError>;

    /// Merge candidates for one tenant; returns what was newly created.
    async fn merge_obligations(
        &self,
        tenant_id: &str,
        candidates: &[ObligationDraft],
    ) -> Result<MergeOutcome, AppError>;

    /// Apply a payment to the targeted obligation.
    async fn record_payment(
        &self,
        tenant_id: &str,
        target: &PaymentTarget,
        amount: f64,
        paid_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<(BillingObligation, PaymentOutcome), AppError>;

    /// Transition unpaid, past-due obligations to overdue; returns the
    /// transitioned set.
    async fn sweep_due(&self, reference: NaiveDate) -> Result<Vec<BillingObligation>, AppError>;
}

/// Postgres-backed store. Mutations run inside a transaction holding a
/// per-tenant advisory lock, and every operation is retried under the
/// configured backoff policy.
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgBillingStore {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn acquire_tenant_lock(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(tenant_id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn fetch_obligations<'a, E>(
        executor: E,
        tenant_id: &str,
    ) -> Result<Vec<BillingObligation>, AppError>
    where
        E: sqlx::Executor<'a, Database = sqlx::Postgres>,
    {
        let rows: Vec<ObligationRow> = sqlx::query_as(
            "SELECT id::text AS id, organization_id::text AS organization_id,
                    tenant_id::text AS tenant_id, unit_id::text AS unit_id,
                    billing_period, amount::float8 AS amount, due_date,
                    status::text AS status, paid_amount::float8 AS paid_amount, paid_date
             FROM billing_obligations
             WHERE tenant_id = $1::uuid
             ORDER BY billing_period",
        )
        .bind(tenant_id)
        .fetch_all(executor)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(ObligationRow::into_model).collect()
    }

    async fn fetch_target_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
        target: &PaymentTarget,
    ) -> Result<Option<BillingObligation>, AppError> {
        let row: Option<ObligationRow> = match target {
            PaymentTarget::Period(period) => {
                sqlx::query_as(
                    "SELECT id::text AS id, organization_id::text AS organization_id,
                            tenant_id::text AS tenant_id, unit_id::text AS unit_id,
                            billing_period, amount::float8 AS amount, due_date,
                            status::text AS status, paid_amount::float8 AS paid_amount, paid_date
                     FROM billing_obligations
                     WHERE tenant_id = $1::uuid AND billing_period = $2
                     LIMIT 1
                     FOR UPDATE",
                )
                .bind(tenant_id)
                .bind(period.to_string())
                .fetch_optional(&mut **tx)
                .await
            }
            PaymentTarget::Obligation(id) => {
                sqlx::query_as(
                    "SELECT id::text AS id, organization_id::text AS organization_id,
                            tenant_id::text AS tenant_id, unit_id::text AS unit_id,
                            billing_period, amount::float8 AS amount, due_date,
                            status::text AS status, paid_amount::float8 AS paid_amount, paid_date
                     FROM billing_obligations
                     WHERE id = $1::uuid AND tenant_id = $2::uuid
                     LIMIT 1
                     FOR UPDATE",
                )
                .bind(id)
                .bind(tenant_id)
                .fetch_optional(&mut **tx)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        row.map(ObligationRow::into_model).transpose()
    }

    async fn merge_once(
        &self,
        tenant_id: &str,
        candidates: &[ObligationDraft],
    ) -> Result<MergeOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Self::acquire_tenant_lock(&mut tx, tenant_id).await?;

        let existing = Self::fetch_obligations(&mut *tx, tenant_id).await?;
        let plan = plan_upsert(&existing, candidates);

        let mut outcome = MergeOutcome::default();
        for obligation in plan.inserts {
            // The unique (tenant_id, billing_period) index turns a lost
            // race into a no-op insert rather than a duplicate row.
            let inserted = sqlx::query_scalar::<_, String>(
                "INSERT INTO billing_obligations
                   (id, organization_id, tenant_id, unit_id, billing_period,
                    amount, due_date, status, paid_amount)
                 VALUES ($1::uuid, $2::uuid, $3::uuid, $4::uuid, $5, $6, $7, $8, $9)
                 ON CONFLICT (tenant_id, billing_period) DO NOTHING
                 RETURNING id::text",
            )
            .bind(&obligation.id)
            .bind(obligation.organization_id.as_deref())
            .bind(&obligation.tenant_id)
            .bind(&obligation.unit_id)
            .bind(obligation.period.to_string())
            .bind(obligation.amount)
            .bind(obligation.due_date)
            .bind(obligation.status.as_str())
            .bind(obligation.paid_amount)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if inserted.is_some() {
                outcome.created.push(obligation);
            }
        }

        for correction in plan.corrections {
            let result = sqlx::query(
                "UPDATE billing_obligations
                 SET amount = $2, due_date = $3
                 WHERE id = $1::uuid AND paid_amount <= $4",
            )
            .bind(&correction.obligation_id)
            .bind(correction.amount)
            .bind(correction.due_date)
            .bind(AMOUNT_EPSILON)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            outcome.corrected += result.rows_affected() as u32;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn record_payment_once(
        &self,
        tenant_id: &str,
        target: &PaymentTarget,
        amount: f64,
        paid_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<(BillingObligation, PaymentOutcome), AppError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Self::acquire_tenant_lock(&mut tx, tenant_id).await?;

        let Some(mut obligation) =
            Self::fetch_target_for_update(&mut tx, tenant_id, target).await?
        else {
            return Err(AppError::NotFound(
                "No billing obligation found for this payment.".to_string(),
            ));
        };

        let outcome = apply_payment(&mut obligation, amount, paid_date, today)?;

        sqlx::query(
            "UPDATE billing_obligations
             SET paid_amount = $2, status = $3, paid_date = $4
             WHERE id = $1::uuid",
        )
        .bind(&obligation.id)
        .bind(obligation.paid_amount)
        .bind(obligation.status.as_str())
        .bind(obligation.paid_date)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok((obligation, outcome))
    }

    async fn sweep_once(&self, reference: NaiveDate) -> Result<Vec<BillingObligation>, AppError> {
        let rows: Vec<ObligationRow> = sqlx::query_as(
            "UPDATE billing_obligations
             SET status = 'overdue'
             WHERE status IN ('pending', 'partial') AND due_date < $1
             RETURNING id::text AS id, organization_id::text AS organization_id,
                       tenant_id::text AS tenant_id, unit_id::text AS unit_id,
                       billing_period, amount::float8 AS amount, due_date,
                       status::text AS status, paid_amount::float8 AS paid_amount, paid_date",
        )
        .bind(reference)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(ObligationRow::into_model).collect()
    }
}

impl BillingStore for PgBillingStore {
    async fn active_lease_terms(
        &self,
        org_id: Option<&str>,
    ) -> Result<Vec<LeaseTerm>, AppError> {
        run_with_retry(&self.retry, || async {
            let rows: Vec<LeaseRow> = sqlx::query_as(
                "SELECT id::text AS id, organization_id::text AS organization_id,
                        tenant_id::text AS tenant_id, unit_id::text AS unit_id,
                        lease_start, lease_end,
                        COALESCE(activated_on, created_at::date) AS activated_on,
                        monthly_amount::float8 AS monthly_amount, status::text AS status
                 FROM leases
                 WHERE status = 'active'
                   AND ($1::uuid IS NULL OR organization_id = $1::uuid)
                 ORDER BY created_at
                 LIMIT 5000",
            )
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.into_iter().map(LeaseRow::into_model).collect()
        })
        .await
    }

    async fn lease_for_tenant(&self, tenant_id: &str) -> Result<Option<LeaseTerm>, AppError> {
        run_with_retry(&self.retry, || async {
            let row: Option<LeaseRow> = sqlx::query_as(
                "SELECT id::text AS id, organization_id::text AS organization_id,
                        tenant_id::text AS tenant_id, unit_id::text AS unit_id,
                        lease_start, lease_end,
                        COALESCE(activated_on, created_at::date) AS activated_on,
                        monthly_amount::float8 AS monthly_amount, status::text AS status
                 FROM leases
                 WHERE tenant_id = $1::uuid
                 ORDER BY created_at DESC
                 LIMIT 1",
            )
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            row.map(LeaseRow::into_model).transpose()
        })
        .await
    }

    async fn obligations_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<BillingObligation>, AppError> {
        run_with_retry(&self.retry, || async {
            let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
            Self::fetch_obligations(&mut *conn, tenant_id).await
        })
        .await
    }

    async fn merge_obligations(
        &self,
        tenant_id: &str,
        candidates: &[ObligationDraft],
    ) -> Result<MergeOutcome, AppError> {
        run_with_retry(&self.retry, || self.merge_once(tenant_id, candidates)).await
    }

    async fn record_payment(
        &self,
        tenant_id: &str,
        target: &PaymentTarget,
        amount: f64,
        paid_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<(BillingObligation, PaymentOutcome), AppError> {
        run_with_retry(&self.retry, || {
            self.record_payment_once(tenant_id, target, amount, paid_date, today)
        })
        .await
    }

    async fn sweep_due(&self, reference: NaiveDate) -> Result<Vec<BillingObligation>, AppError> {
        run_with_retry(&self.retry, || self.sweep_once(reference)).await
    }
}

#[derive(sqlx::FromRow)]
struct ObligationRow {
    id: String,
    organization_id: Option<String>,
    tenant_id: String,
    unit_id: String,
    billing_period: String,
    amount: f64,
    due_date: NaiveDate,
    status: String,
    paid_amount: f64,
    paid_date: Option<NaiveDate>,
}

impl ObligationRow {
    fn into_model(self) -> Result<BillingObligation, AppError> {
        Ok(BillingObligation {
            period: BillingPeriod::from_str(&self.billing_period)?,
            status: ObligationStatus::from_str(&self.status)?,
            id: self.id,
            organization_id: self.organization_id,
            tenant_id: self.tenant_id,
            unit_id: self.unit_id,
            amount: self.amount,
            due_date: self.due_date,
            paid_amount: self.paid_amount,
            paid_date: self.paid_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    id: String,
    organization_id: Option<String>,
    tenant_id: String,
    unit_id: String,
    lease_start: Option<NaiveDate>,
    lease_end: Option<NaiveDate>,
    activated_on: NaiveDate,
    monthly_amount: f64,
    status: String,
}

impl LeaseRow {
    fn into_model(self) -> Result<LeaseTerm, AppError> {
        Ok(LeaseTerm {
            status: self.status.parse()?,
            id: self.id,
            organization_id: self.organization_id,
            tenant_id: self.tenant_id,
            unit_id: self.unit_id,
            lease_start: self.lease_start,
            lease_end: self.lease_end,
            activated_on: self.activated_on,
            monthly_amount: self.monthly_amount,
        })
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory store used by the engine tests. Mirrors the Postgres
    //! implementation by funneling every mutation through the same pure
    //! planning/application functions.

    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;
    use crate::billing::reconcile::sweep_applies;

    #[derive(Default)]
    pub struct MemoryBillingStore {
        inner: Mutex<MemoryState>,
    }

    #[derive(Default)]
    struct MemoryState {
        leases: Vec<LeaseTerm>,
        obligations: HashMap<String, Vec<BillingObligation>>,
    }

    impl MemoryBillingStore {
        pub async fn add_lease(&self, lease: LeaseTerm) {
            self.inner.lock().await.leases.push(lease);
        }

        pub async fn all_obligations(&self) -> Vec<BillingObligation> {
            let state = self.inner.lock().await;
            state.obligations.values().flatten().cloned().collect()
        }
    }

    impl BillingStore for MemoryBillingStore {
        async fn active_lease_terms(
            &self,
            org_id: Option<&str>,
        ) -> Result<Vec<LeaseTerm>, AppError> {
            let state = self.inner.lock().await;
            Ok(state
                .leases
                .iter()
                .filter(|lease| lease.status == crate::billing::model::LeaseStatus::Active)
                .filter(|lease| {
                    org_id.is_none() || lease.organization_id.as_deref() == org_id
                })
                .cloned()
                .collect())
        }

        async fn lease_for_tenant(
            &self,
            tenant_id: &str,
        ) -> Result<Option<LeaseTerm>, AppError> {
            let state = self.inner.lock().await;
            Ok(state
                .leases
                .iter()
                .rev()
                .find(|lease| lease.tenant_id == tenant_id)
                .cloned())
        }

        async fn obligations_for_tenant(
            &self,
            tenant_id: &str,
        ) -> Result<Vec<BillingObligation>, AppError> {
            let state = self.inner.lock().await;
            Ok(state
                .obligations
                .get(tenant_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn merge_obligations(
            &self,
            tenant_id: &str,
            candidates: &[ObligationDraft],
        ) -> Result<MergeOutcome, AppError> {
            let mut state = self.inner.lock().await;
            let existing = state.obligations.entry(tenant_id.to_string()).or_default();
            let plan = plan_upsert(existing, candidates);

            let mut outcome = MergeOutcome::default();
            for correction in plan.corrections {
                if let Some(obligation) = existing
                    .iter_mut()
                    .find(|o| o.id == correction.obligation_id)
                {
                    if obligation.paid_amount <= AMOUNT_EPSILON {
                        obligation.amount = correction.amount;
                        obligation.due_date = correction.due_date;
                        outcome.corrected += 1;
                    }
                }
            }
            for obligation in plan.inserts {
                existing.push(obligation.clone());
                outcome.created.push(obligation);
            }
            existing.sort_by_key(|o| o.period);
            Ok(outcome)
        }

        async fn record_payment(
            &self,
            tenant_id: &str,
            target: &PaymentTarget,
            amount: f64,
            paid_date: NaiveDate,
            today: NaiveDate,
        ) -> Result<(BillingObligation, PaymentOutcome), AppError> {
            let mut state = self.inner.lock().await;
            let obligations = state
                .obligations
                .get_mut(tenant_id)
                .ok_or_else(|| not_found())?;

            let obligation = obligations
                .iter_mut()
                .find(|o| match target {
                    PaymentTarget::Period(period) => o.period == *period,
                    PaymentTarget::Obligation(id) => o.id == *id,
                })
                .ok_or_else(|| not_found())?;

            let outcome = apply_payment(obligation, amount, paid_date, today)?;
            Ok((obligation.clone(), outcome))
        }

        async fn sweep_due(
            &self,
            reference: NaiveDate,
        ) -> Result<Vec<BillingObligation>, AppError> {
            let mut state = self.inner.lock().await;
            let mut transitioned = Vec::new();
            for obligations in state.obligations.values_mut() {
                for obligation in obligations.iter_mut() {
                    if sweep_applies(obligation, reference) {
                        obligation.status = ObligationStatus::Overdue;
                        transitioned.push(obligation.clone());
                    }
                }
            }
            Ok(transitioned)
        }
    }

    fn not_found() -> AppError {
        AppError::NotFound("No billing obligation found for this payment.".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::PaymentTarget;

    #[test]
    fn payment_targets_parse_periods_and_ids() {
        assert!(matches!(
            PaymentTarget::parse("2024-02"),
            PaymentTarget::Period(_)
        ));
        assert!(matches!(
            PaymentTarget::parse("550e8400-e29b-41d4-a716-446655440000"),
            PaymentTarget::Obligation(_)
        ));
        assert!(matches!(
            PaymentTarget::parse("not-a-period"),
            PaymentTarget::Obligation(_)
        ));
    }
}

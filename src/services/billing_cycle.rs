use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::billing::engine::{run_billing_cycle, sweep_overdue, BillingCycleRun};
use crate::billing::model::BillingObligation;
use crate::billing::retry::RetryPolicy;
use crate::billing::store::PgBillingStore;
use crate::config::AppConfig;
use crate::repository::table_service::{create_row, get_row};

/// Result of one scheduled billing run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BillingCycleResult {
    pub leases_scanned: u32,
    pub generated: u32,
    pub corrected: u32,
    pub swept_overdue: u32,
    pub notices_queued: u32,
    pub errors: u32,
}

fn billing_store(pool: &PgPool, config: &AppConfig) -> PgBillingStore {
    PgBillingStore::new(pool.clone(), RetryPolicy::from_config(config))
}

/// "Today" in the organization-facing billing timezone.
pub fn billing_today(config: &AppConfig) -> chrono::NaiveDate {
    Utc::now().with_timezone(&config.billing_timezone).date_naive()
}

/// One generation pass over every active lease (or one org's leases).
pub async fn run_generation(
    pool: &PgPool,
    config: &AppConfig,
    org_id: Option<&str>,
) -> Result<BillingCycleRun, crate::error::AppError> {
    let store = billing_store(pool, config);
    run_billing_cycle(
        &store,
        org_id,
        billing_today(config),
        config.billing_backfill_months,
    )
    .await
}

/// The daily cycle: generate missing obligations, then sweep overdue
/// ones and queue a notice for each transition.
pub async fn run_daily_billing_cycle(
    pool: &PgPool,
    config: &AppConfig,
    org_id: Option<&str>,
) -> BillingCycleResult {
    let mut result = BillingCycleResult::default();

    match run_generation(pool, config, org_id).await {
        Ok(run) => {
            result.leases_scanned = run.leases_scanned;
            result.generated = run.created;
            result.corrected = run.corrected;
            result.errors += run.errors;
        }
        Err(error) => {
            warn!(error = %error, "Billing generation pass failed");
            result.errors += 1;
        }
    }

    let sweep = run_overdue_sweep(pool, config).await;
    result.swept_overdue = sweep.swept_overdue;
    result.notices_queued = sweep.notices_queued;
    result.errors += sweep.errors;

    info!(
        leases = result.leases_scanned,
        generated = result.generated,
        corrected = result.corrected,
        overdue = result.swept_overdue,
        notices = result.notices_queued,
        errors = result.errors,
        "Billing cycle completed"
    );

    result
}

/// Sweep unpaid, past-due obligations and queue an overdue notice for
/// each one that transitioned. Re-running is harmless: an obligation
/// transitions (and is announced) at most once.
pub async fn run_overdue_sweep(pool: &PgPool, config: &AppConfig) -> BillingCycleResult {
    let mut result = BillingCycleResult::default();
    let store = billing_store(pool, config);

    let transitioned = match sweep_overdue(&store, billing_today(config)).await {
        Ok(obligations) => obligations,
        Err(error) => {
            warn!(error = %error, "Overdue sweep failed");
            result.errors += 1;
            return result;
        }
    };

    result.swept_overdue = transitioned.len() as u32;
    for obligation in &transitioned {
        if queue_overdue_notice(pool, config, obligation).await {
            result.notices_queued += 1;
        }
    }

    if result.swept_overdue > 0 {
        info!(
            overdue = result.swept_overdue,
            notices = result.notices_queued,
            "Overdue sweep completed"
        );
    }

    result
}

/// Queue a reminder row for the delivery system. Delivery itself is an
/// external collaborator; this service only writes `message_logs`.
async fn queue_overdue_notice(
    pool: &PgPool,
    config: &AppConfig,
    obligation: &BillingObligation,
) -> bool {
    let tenant = match get_row(pool, "tenants", &obligation.tenant_id, "id").await {
        Ok(row) => row,
        Err(error) => {
            warn!(
                tenant_id = %obligation.tenant_id,
                error = %error,
                "Could not load tenant for overdue notice"
            );
            return false;
        }
    };

    let tenant_name = val_str(&tenant, "full_name");
    let tenant_email = val_str(&tenant, "email");
    if tenant_email.is_empty() {
        return false;
    }

    let amount_display = format_amount(
        obligation.amount - obligation.paid_amount,
        &config.default_currency,
    );
    let period = obligation.period.to_string();
    let due_date = obligation.due_date.to_string();
    let app_url = &config.app_public_url;
    let body = format!(
        "Hi {tenant_name},\n\n\
         Your rent payment of {amount_display} for {period} was due on {due_date} \
         and is now overdue.\n\n\
         Please settle your balance as soon as possible:\n\
         {app_url}/tenant/payments\n\n\
         If you have already paid, please send us your receipt.\n\
         — Rentora"
    );

    let mut msg = Map::new();
    if let Some(org_id) = obligation.organization_id.as_deref() {
        msg.insert(
            "organization_id".to_string(),
            Value::String(org_id.to_string()),
        );
    }
    msg.insert("channel".to_string(), Value::String("email".to_string()));
    msg.insert("recipient".to_string(), Value::String(tenant_email));
    msg.insert("status".to_string(), Value::String("queued".to_string()));
    msg.insert(
        "scheduled_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );

    let mut payload = Map::new();
    payload.insert("body".to_string(), Value::String(body));
    payload.insert(
        "notice_type".to_string(),
        Value::String("rent_overdue".to_string()),
    );
    payload.insert(
        "obligation_id".to_string(),
        Value::String(obligation.id.clone()),
    );
    payload.insert("billing_period".to_string(), Value::String(period));
    msg.insert("payload".to_string(), Value::Object(payload));

    match create_row(pool, "message_logs", &msg).await {
        Ok(_) => true,
        Err(error) => {
            warn!(
                obligation_id = %obligation.id,
                error = %error,
                "Failed to queue overdue notice"
            );
            false
        }
    }
}

fn format_amount(amount: f64, currency: &str) -> String {
    match currency {
        "USD" => format!("${amount:.2}"),
        _ => format!("{amount:.2} {currency}"),
    }
}

fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::format_amount;

    #[test]
    fn formats_usd_and_other_currencies() {
        assert_eq!(format_amount(1200.0, "USD"), "$1200.00");
        assert_eq!(format_amount(850.5, "EUR"), "850.50 EUR");
    }
}

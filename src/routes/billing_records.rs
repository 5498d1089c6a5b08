use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    billing::engine::tenant_outstanding_balance,
    billing::model::{BillingObligation, BillingPeriod, ObligationDraft},
    billing::retry::RetryPolicy,
    billing::store::{BillingStore, PgBillingStore},
    error::{AppError, AppResult},
    repository::table_service::{get_row, update_row},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, BillingRecordPath,
        CreateBillingRecordInput, GenerateBillingQuery, TenantPath, UpdateBillingRecordInput,
    },
    services::billing_cycle::{run_daily_billing_cycle, run_generation},
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const BILLING_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/billing-records",
            axum::routing::post(create_billing_record),
        )
        .route(
            "/billing-records/generate-monthly",
            axum::routing::post(generate_monthly),
        )
        .route(
            "/billing-records/run-automatic",
            axum::routing::post(run_automatic),
        )
        .route(
            "/billing-records/{record_id}",
            axum::routing::patch(update_billing_record),
        )
        .route(
            "/billing-records/tenant/{tenant_id}",
            axum::routing::get(list_tenant_billing_records),
        )
        .route(
            "/outstanding-balance/{tenant_id}",
            axum::routing::get(outstanding_balance),
        )
}

fn billing_store(state: &AppState) -> AppResult<PgBillingStore> {
    let pool = db_pool(state)?;
    Ok(PgBillingStore::new(
        pool.clone(),
        RetryPolicy::from_config(&state.config),
    ))
}

/// A tenant's billing ledger. A tenant with no history gets an empty
/// list, not an error.
async fn list_tenant_billing_records(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    authorize_tenant_access(&state, &user_id, &path.tenant_id).await?;

    let store = billing_store(&state)?;
    let obligations = store.obligations_for_tenant(&path.tenant_id).await?;

    let data: Vec<Value> = obligations.iter().map(obligation_json).collect();
    Ok(Json(json!({ "data": data })))
}

/// Manually add one billing record. Goes through the same idempotent
/// merge as the generator, so posting an existing period changes
/// nothing and never duplicates.
async fn create_billing_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBillingRecordInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, BILLING_EDIT_ROLES).await?;
    validate_input(&payload)?;

    let period: BillingPeriod = payload.billing_period.parse()?;
    let due_date = parse_date(&payload.due_date)?;

    let draft = ObligationDraft {
        tenant_id: payload.tenant_id.clone(),
        unit_id: payload.unit_id.clone(),
        organization_id: Some(payload.organization_id.clone()),
        period,
        amount: payload.amount,
        due_date,
    };

    let store = billing_store(&state)?;
    let outcome = store
        .merge_obligations(&payload.tenant_id, &[draft])
        .await?;

    let created = outcome.created.first().cloned();
    let status_code = if created.is_some() {
        axum::http::StatusCode::CREATED
    } else {
        axum::http::StatusCode::OK
    };

    let record = match created {
        Some(obligation) => obligation_json(&obligation),
        None => {
            // Period already existed; return the current row.
            let obligations = store.obligations_for_tenant(&payload.tenant_id).await?;
            obligations
                .iter()
                .find(|o| o.period == period)
                .map(obligation_json)
                .unwrap_or_else(|| Value::Object(Map::new()))
        }
    };

    Ok((status_code, Json(record)))
}

/// Admin correction of a single record. Amount and due date can only
/// change while nothing has been paid against the period.
async fn update_billing_record(
    State(state): State<AppState>,
    Path(path): Path<BillingRecordPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateBillingRecordInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "billing_obligations", &path.record_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, BILLING_EDIT_ROLES).await?;

    let paid_amount = record
        .as_object()
        .and_then(|obj| obj.get("paid_amount"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let mut patch = remove_nulls(serialize_to_map(&payload));
    if paid_amount > 0.0 && (patch.contains_key("amount") || patch.contains_key("due_date")) {
        return Err(AppError::Conflict(
            "This period already has payments recorded; amount and due date are frozen."
                .to_string(),
        ));
    }
    if patch.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let updated = update_row(pool, "billing_obligations", &path.record_id, &patch, "id").await?;
    Ok(Json(updated))
}

/// Entry point for the monthly scheduler trigger (and manual runs).
async fn generate_monthly(
    State(state): State<AppState>,
    Query(query): Query<GenerateBillingQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    if let Some(org_id) = query.org_id.as_deref() {
        assert_org_role(&state, &user_id, org_id, BILLING_EDIT_ROLES).await?;
    }
    let pool = db_pool(&state)?;

    let run = run_generation(pool, &state.config, query.org_id.as_deref()).await?;
    Ok(Json(json!({
        "generated": run.created,
        "corrected": run.corrected,
        "leases_scanned": run.leases_scanned,
        "errors": run.errors
    })))
}

/// Full automatic pass: generation plus the overdue sweep.
async fn run_automatic(
    State(state): State<AppState>,
    Query(query): Query<GenerateBillingQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    if let Some(org_id) = query.org_id.as_deref() {
        assert_org_role(&state, &user_id, org_id, BILLING_EDIT_ROLES).await?;
    }
    let pool = db_pool(&state)?;

    let result = run_daily_billing_cycle(pool, &state.config, query.org_id.as_deref()).await;
    Ok(Json(json!({
        "generated": result.generated,
        "updated": result.corrected + result.swept_overdue,
        "swept_overdue": result.swept_overdue,
        "notices_queued": result.notices_queued,
        "errors": result.errors
    })))
}

async fn outstanding_balance(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    authorize_tenant_access(&state, &user_id, &path.tenant_id).await?;

    let store = billing_store(&state)?;
    let balance = tenant_outstanding_balance(&store, &path.tenant_id).await?;

    Ok(Json(json!({
        "tenant_id": path.tenant_id,
        "balance": balance
    })))
}

/// Resolve the tenant's org for the membership check. An unknown tenant
/// is treated as "no billing history" (valid for queries), so access is
/// allowed through and the caller sees empty data.
async fn authorize_tenant_access(
    state: &AppState,
    user_id: &str,
    tenant_id: &str,
) -> AppResult<()> {
    let pool = db_pool(state)?;
    match get_row(pool, "tenants", tenant_id, "id").await {
        Ok(tenant) => {
            let org_id = value_str(&tenant, "organization_id");
            if !org_id.is_empty() {
                assert_org_member(state, user_id, &org_id).await?;
            }
            Ok(())
        }
        Err(AppError::NotFound(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

fn obligation_json(obligation: &BillingObligation) -> Value {
    json!({
        "id": obligation.id,
        "organization_id": obligation.organization_id,
        "tenant_id": obligation.tenant_id,
        "unit_id": obligation.unit_id,
        "billing_period": obligation.period.to_string(),
        "amount": obligation.amount,
        "due_date": obligation.due_date.to_string(),
        "status": obligation.status.as_str(),
        "paid_amount": obligation.paid_amount,
        "paid_date": obligation.paid_date.map(|d| d.to_string()),
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("Invalid date '{raw}' (expected YYYY-MM-DD).")))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

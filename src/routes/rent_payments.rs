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
    billing::engine::record_payment,
    billing::retry::RetryPolicy,
    billing::store::{PaymentTarget, PgBillingStore},
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        CreateRentPaymentInput, RentPaymentPath, RentPaymentsQuery, UpdateRentPaymentInput,
    },
    services::audit::write_audit_log,
    services::billing_cycle::billing_today,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const PAYMENT_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/rent-payments",
            axum::routing::get(list_rent_payments).post(create_rent_payment),
        )
        .route(
            "/rent-payments/{payment_id}",
            axum::routing::get(get_rent_payment).patch(update_rent_payment),
        )
}

async fn list_rent_payments(
    State(state): State<AppState>,
    Query(query): Query<RentPaymentsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(query.org_id.clone()),
    );
    if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
        filters.insert("tenant_id".to_string(), Value::String(tenant_id));
    }

    let rows = list_rows(
        pool,
        "rent_payments",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

/// Record a payment: applies it to the targeted obligation through the
/// reconciler (additive, never regresses a paid period), then stores
/// the payment row itself as history.
async fn create_rent_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateRentPaymentInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, PAYMENT_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let today = billing_today(&state.config);
    let paid_date = match payload.paid_date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => today,
    };

    // Default to the current billing period when none is given.
    let target = match payload.billing_period.as_deref() {
        Some(raw) => PaymentTarget::parse(raw),
        None => PaymentTarget::parse(
            &crate::billing::model::BillingPeriod::from_date(today).to_string(),
        ),
    };

    let store = PgBillingStore::new(pool.clone(), RetryPolicy::from_config(&state.config));
    let (obligation, outcome) = record_payment(
        &store,
        &payload.tenant_id,
        &target,
        payload.amount,
        paid_date,
        today,
    )
    .await?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.remove("billing_period");
    record.insert(
        "obligation_id".to_string(),
        Value::String(obligation.id.clone()),
    );
    record.insert(
        "due_date".to_string(),
        Value::String(obligation.due_date.to_string()),
    );
    record.insert(
        "paid_date".to_string(),
        Value::String(paid_date.to_string()),
    );
    record.insert(
        "status".to_string(),
        Value::String(outcome.status.as_str().to_string()),
    );
    if !record.contains_key("unit_id") {
        record.insert(
            "unit_id".to_string(),
            Value::String(obligation.unit_id.clone()),
        );
    }
    record.insert(
        "recorded_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "rent_payments", &record).await?;
    let payment_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "rent_payments",
        Some(&payment_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({
            "payment": created,
            "obligation": {
                "id": obligation.id,
                "billing_period": obligation.period.to_string(),
                "status": outcome.status.as_str(),
                "paid_amount": outcome.paid_amount,
                "remaining": outcome.remaining,
            }
        })),
    ))
}

async fn get_rent_payment(
    State(state): State<AppState>,
    Path(path): Path<RentPaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let payment = get_row(pool, "rent_payments", &path.payment_id, "id").await?;
    let org_id = value_str(&payment, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(payment))
}

/// Only descriptive fields are editable. The amount is immutable once
/// applied to the ledger; corrections happen as new payments.
async fn update_rent_payment(
    State(state): State<AppState>,
    Path(path): Path<RentPaymentPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateRentPaymentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "rent_payments", &path.payment_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, PAYMENT_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let updated = update_row(pool, "rent_payments", &path.payment_id, &patch, "id").await?;
    Ok(Json(updated))
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

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    billing::engine::upsert_lease_obligations,
    billing::retry::RetryPolicy,
    billing::store::{BillingStore, PgBillingStore},
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateLeaseInput,
        LeasePath, LeasesQuery, UpdateLeaseInput,
    },
    services::audit::write_audit_log,
    services::billing_cycle::billing_today,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const LEASE_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/leases", axum::routing::get(list_leases).post(create_lease))
        .route(
            "/leases/{lease_id}",
            axum::routing::get(get_lease).patch(update_lease),
        )
        .route(
            "/leases/{lease_id}/terminate",
            axum::routing::post(terminate_lease),
        )
}

async fn list_leases(
    State(state): State<AppState>,
    Query(query): Query<LeasesQuery>,
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
    if let Some(unit_id) = non_empty_opt(query.unit_id.as_deref()) {
        filters.insert("unit_id".to_string(), Value::String(unit_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        pool,
        "leases",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_lease(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateLeaseInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, LEASE_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let tenant = get_row(pool, "tenants", &payload.tenant_id, "id").await?;
    if value_str(&tenant, "organization_id") != payload.organization_id {
        return Err(AppError::BadRequest(
            "tenant_id does not belong to this organization.".to_string(),
        ));
    }
    let unit = get_row(pool, "units", &payload.unit_id, "id").await?;
    if value_str(&unit, "organization_id") != payload.organization_id {
        return Err(AppError::BadRequest(
            "unit_id does not belong to this organization.".to_string(),
        ));
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "activated_on".to_string(),
        Value::String(billing_today(&state.config).to_string()),
    );
    let created = create_row(pool, "leases", &record).await?;
    let lease_id = value_str(&created, "id");

    // An active lease must have obligations for every elapsed month
    // from day one; do the backfill synchronously.
    backfill_for_tenant(&state, &payload.tenant_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "leases",
        Some(&lease_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let lease = get_row(pool, "leases", &path.lease_id, "id").await?;
    let org_id = value_str(&lease, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(lease))
}

async fn update_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateLeaseInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "leases", &path.lease_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, LEASE_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "leases", &path.lease_id, &patch, "id").await?;

    // Changed terms propagate to unpaid periods only; periods with any
    // payment recorded stay frozen inside the merge.
    let tenant_id = value_str(&updated, "tenant_id");
    if !tenant_id.is_empty() {
        backfill_for_tenant(&state, &tenant_id).await?;
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "leases",
        Some(&path.lease_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Terminate = soft-retire: the lease flips to inactive with an end
/// date; billing history stays untouched.
async fn terminate_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let lease = get_row(pool, "leases", &path.lease_id, "id").await?;
    let org_id = value_str(&lease, "organization_id");
    assert_org_role(&state, &user_id, &org_id, LEASE_EDIT_ROLES).await?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("inactive".to_string()));
    if value_str(&lease, "lease_end").is_empty() {
        patch.insert(
            "lease_end".to_string(),
            Value::String(billing_today(&state.config).to_string()),
        );
    }

    let updated = update_row(pool, "leases", &path.lease_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "status_transition",
        "leases",
        Some(&path.lease_id),
        Some(lease),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn backfill_for_tenant(state: &AppState, tenant_id: &str) -> AppResult<()> {
    let pool = db_pool(state)?;
    let store = PgBillingStore::new(pool.clone(), RetryPolicy::from_config(&state.config));

    let Some(lease) = store.lease_for_tenant(tenant_id).await? else {
        return Ok(());
    };

    upsert_lease_obligations(
        &store,
        &lease,
        billing_today(&state.config),
        state.config.billing_backfill_months,
    )
    .await?;
    Ok(())
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

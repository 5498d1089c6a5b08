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
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateTenantInput,
        OrgScopedQuery, TenantPath, UpdateTenantInput,
    },
    services::audit::write_audit_log,
    services::billing_cycle::billing_today,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const TENANT_EDIT_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/tenants",
            axum::routing::get(list_tenants).post(create_tenant),
        )
        .route(
            "/tenants/{tenant_id}",
            axum::routing::get(get_tenant)
                .patch(update_tenant)
                .delete(delete_tenant),
        )
}

async fn list_tenants(
    State(state): State<AppState>,
    Query(query): Query<OrgScopedQuery>,
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
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        pool,
        "tenants",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTenantInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, TENANT_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    // Lease terms live on the lease row, not on the tenant.
    for key in ["unit_id", "lease_start", "lease_end", "monthly_rent"] {
        record.remove(key);
    }

    let created = create_row(pool, "tenants", &record).await?;
    let tenant_id = value_str(&created, "id");

    // A tenant created with lease terms gets a lease row alongside, and
    // an immediate backfill when that lease is already active.
    if let Some(unit_id) = payload.unit_id.as_deref() {
        let mut lease = Map::new();
        lease.insert(
            "organization_id".to_string(),
            Value::String(payload.organization_id.clone()),
        );
        lease.insert("tenant_id".to_string(), Value::String(tenant_id.clone()));
        lease.insert("unit_id".to_string(), Value::String(unit_id.to_string()));
        lease.insert(
            "monthly_amount".to_string(),
            json!(payload.monthly_rent.unwrap_or(0.0)),
        );
        lease.insert(
            "status".to_string(),
            Value::String(payload.status.clone()),
        );
        if let Some(lease_start) = payload.lease_start.as_deref() {
            lease.insert(
                "lease_start".to_string(),
                Value::String(lease_start.to_string()),
            );
        }
        if let Some(lease_end) = payload.lease_end.as_deref() {
            lease.insert(
                "lease_end".to_string(),
                Value::String(lease_end.to_string()),
            );
        }
        lease.insert(
            "activated_on".to_string(),
            Value::String(billing_today(&state.config).to_string()),
        );
        create_row(pool, "leases", &lease).await?;
        backfill_tenant_obligations(&state, &tenant_id).await?;
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "tenants",
        Some(&tenant_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let tenant = get_row(pool, "tenants", &path.tenant_id, "id").await?;
    let org_id = value_str(&tenant, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(tenant))
}

async fn update_tenant(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateTenantInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "tenants", &path.tenant_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TENANT_EDIT_ROLES).await?;

    let mut patch = remove_nulls(serialize_to_map(&payload));
    for key in ["unit_id", "lease_start", "lease_end", "monthly_rent"] {
        patch.remove(key);
    }
    let updated = if patch.is_empty() {
        before.clone()
    } else {
        update_row(pool, "tenants", &path.tenant_id, &patch, "id").await?
    };

    // Lease-term changes flow through to the lease row and trigger a
    // re-backfill; paid periods stay frozen inside the merge.
    let lease_fields_present = payload.unit_id.is_some()
        || payload.lease_start.is_some()
        || payload.lease_end.is_some()
        || payload.monthly_rent.is_some()
        || payload.status.is_some();
    if lease_fields_present {
        sync_tenant_lease(&state, &org_id, &path.tenant_id, &payload).await?;
        backfill_tenant_obligations(&state, &path.tenant_id).await?;
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "tenants",
        Some(&path.tenant_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Tenants with recorded payment history are retired, never deleted.
async fn delete_tenant(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let tenant = get_row(pool, "tenants", &path.tenant_id, "id").await?;
    let org_id = value_str(&tenant, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TENANT_EDIT_ROLES).await?;

    let payment_count = count_rows(
        pool,
        "rent_payments",
        Some(&json_map(&[(
            "tenant_id",
            Value::String(path.tenant_id.clone()),
        )])),
    )
    .await?;

    if payment_count > 0 {
        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String("inactive".to_string()));
        let retired = update_row(pool, "tenants", &path.tenant_id, &patch, "id").await?;
        retire_tenant_leases(pool, &path.tenant_id).await?;
        return Ok(Json(json!({ "retired": true, "tenant": retired })));
    }

    let deleted = delete_row(pool, "tenants", &path.tenant_id, "id").await?;
    Ok(Json(json!({ "retired": false, "tenant": deleted })))
}

async fn sync_tenant_lease(
    state: &AppState,
    org_id: &str,
    tenant_id: &str,
    payload: &UpdateTenantInput,
) -> AppResult<()> {
    let pool = db_pool(state)?;

    let leases = list_rows(
        pool,
        "leases",
        Some(&json_map(&[(
            "tenant_id",
            Value::String(tenant_id.to_string()),
        )])),
        1,
        0,
        "created_at",
        false,
    )
    .await?;

    let mut lease_patch = Map::new();
    if let Some(unit_id) = payload.unit_id.as_deref() {
        lease_patch.insert("unit_id".to_string(), Value::String(unit_id.to_string()));
    }
    if let Some(lease_start) = payload.lease_start.as_deref() {
        lease_patch.insert(
            "lease_start".to_string(),
            Value::String(lease_start.to_string()),
        );
    }
    if let Some(lease_end) = payload.lease_end.as_deref() {
        lease_patch.insert(
            "lease_end".to_string(),
            Value::String(lease_end.to_string()),
        );
    }
    if let Some(monthly_rent) = payload.monthly_rent {
        lease_patch.insert("monthly_amount".to_string(), json!(monthly_rent));
    }
    if let Some(status) = payload.status.as_deref() {
        lease_patch.insert("status".to_string(), Value::String(status.to_string()));
    }

    match leases.first() {
        Some(lease) => {
            let lease_id = value_str(lease, "id");
            if !lease_patch.is_empty() && !lease_id.is_empty() {
                update_row(pool, "leases", &lease_id, &lease_patch, "id").await?;
            }
        }
        None => {
            if payload.unit_id.is_some() {
                lease_patch.insert(
                    "organization_id".to_string(),
                    Value::String(org_id.to_string()),
                );
                lease_patch.insert(
                    "tenant_id".to_string(),
                    Value::String(tenant_id.to_string()),
                );
                lease_patch.insert(
                    "activated_on".to_string(),
                    Value::String(billing_today(&state.config).to_string()),
                );
                create_row(pool, "leases", &lease_patch).await?;
            }
        }
    }

    Ok(())
}

async fn retire_tenant_leases(pool: &sqlx::PgPool, tenant_id: &str) -> AppResult<()> {
    let leases = list_rows(
        pool,
        "leases",
        Some(&json_map(&[(
            "tenant_id",
            Value::String(tenant_id.to_string()),
        )])),
        100,
        0,
        "created_at",
        false,
    )
    .await?;

    for lease in leases {
        let lease_id = value_str(&lease, "id");
        if lease_id.is_empty() {
            continue;
        }
        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String("inactive".to_string()));
        let _ = update_row(pool, "leases", &lease_id, &patch, "id").await;
    }
    Ok(())
}

/// Synchronous backfill so the §3 invariant holds the moment a lease
/// becomes active: every elapsed month has its obligation.
async fn backfill_tenant_obligations(state: &AppState, tenant_id: &str) -> AppResult<()> {
    let pool = db_pool(state)?;
    let store = PgBillingStore::new(pool.clone(), RetryPolicy::from_config(&state.config));

    let Some(lease) = store.lease_for_tenant(tenant_id).await? else {
        return Ok(());
    };

    let outcome = upsert_lease_obligations(
        &store,
        &lease,
        billing_today(&state.config),
        state.config.billing_backfill_months,
    )
    .await?;

    if !outcome.created.is_empty() || outcome.corrected > 0 {
        tracing::info!(
            tenant_id,
            created = outcome.created.len(),
            corrected = outcome.corrected,
            "Backfilled billing obligations for tenant"
        );
    }
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

fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

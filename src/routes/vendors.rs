use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateVendorInput,
        OrgScopedQuery, UpdateVendorInput, VendorPath,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const VENDOR_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/vendors",
            axum::routing::get(list_vendors).post(create_vendor),
        )
        .route(
            "/vendors/{vendor_id}",
            axum::routing::get(get_vendor)
                .patch(update_vendor)
                .delete(delete_vendor),
        )
}

async fn list_vendors(
    State(state): State<AppState>,
    Query(query): Query<OrgScopedQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let rows = list_rows(
        pool,
        "vendors",
        Some(&json_map(&[(
            "organization_id",
            Value::String(query.org_id.clone()),
        )])),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "name",
        true,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_vendor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateVendorInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, VENDOR_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "vendors", &record).await?;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_vendor(
    State(state): State<AppState>,
    Path(path): Path<VendorPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let vendor = get_row(pool, "vendors", &path.vendor_id, "id").await?;
    let org_id = value_str(&vendor, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(vendor))
}

async fn update_vendor(
    State(state): State<AppState>,
    Path(path): Path<VendorPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateVendorInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "vendors", &path.vendor_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, VENDOR_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "vendors", &path.vendor_id, &patch, "id").await?;

    Ok(Json(updated))
}

async fn delete_vendor(
    State(state): State<AppState>,
    Path(path): Path<VendorPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let vendor = get_row(pool, "vendors", &path.vendor_id, "id").await?;
    let org_id = value_str(&vendor, "organization_id");
    assert_org_role(&state, &user_id, &org_id, VENDOR_EDIT_ROLES).await?;

    let deleted = delete_row(pool, "vendors", &path.vendor_id, "id").await?;
    Ok(Json(deleted))
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

fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

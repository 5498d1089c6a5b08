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
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreatePropertyInput,
        CreateUnitInput, OrgScopedQuery, PropertyPath, UnitPath, UnitsQuery, UpdatePropertyInput,
        UpdateUnitInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const PROPERTY_EDIT_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/properties",
            axum::routing::get(list_properties).post(create_property),
        )
        .route(
            "/properties/{property_id}",
            axum::routing::get(get_property).patch(update_property),
        )
        .route("/units", axum::routing::get(list_units).post(create_unit))
        .route(
            "/units/{unit_id}",
            axum::routing::get(get_unit).patch(update_unit),
        )
}

async fn list_properties(
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
        "properties",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePropertyInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, PROPERTY_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "properties", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "properties",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let property = get_row(pool, "properties", &path.property_id, "id").await?;
    let org_id = value_str(&property, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(property))
}

async fn update_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePropertyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "properties", &path.property_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, PROPERTY_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "properties", &path.property_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "properties",
        Some(&path.property_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn list_units(
    State(state): State<AppState>,
    Query(query): Query<UnitsQuery>,
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
    if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        pool,
        "units",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUnitInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, PROPERTY_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    // Guard against cross-org property references.
    let property = get_row(pool, "properties", &payload.property_id, "id").await?;
    if value_str(&property, "organization_id") != payload.organization_id {
        return Err(AppError::BadRequest(
            "property_id does not belong to this organization.".to_string(),
        ));
    }

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "units", &record).await?;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let unit = get_row(pool, "units", &path.unit_id, "id").await?;
    let org_id = value_str(&unit, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(unit))
}

async fn update_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUnitInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "units", &path.unit_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, PROPERTY_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "units", &path.unit_id, &patch, "id").await?;

    Ok(Json(updated))
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

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        CreateMaintenanceTaskInput, MaintenanceQuery, MaintenanceTaskPath,
        UpdateMaintenanceTaskInput,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const TASK_EDIT_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/maintenance-tasks",
            axum::routing::get(list_tasks).post(create_task),
        )
        .route(
            "/maintenance-tasks/{task_id}",
            axum::routing::get(get_task).patch(update_task),
        )
        .route(
            "/maintenance-tasks/{task_id}/complete",
            axum::routing::post(complete_task),
        )
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<MaintenanceQuery>,
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
    if let Some(priority) = non_empty_opt(query.priority.as_deref()) {
        filters.insert("priority".to_string(), Value::String(priority));
    }

    let rows = list_rows(
        pool,
        "maintenance_tasks",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateMaintenanceTaskInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, TASK_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "maintenance_tasks", &record).await?;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(path): Path<MaintenanceTaskPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let task = get_row(pool, "maintenance_tasks", &path.task_id, "id").await?;
    let org_id = value_str(&task, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(task))
}

async fn update_task(
    State(state): State<AppState>,
    Path(path): Path<MaintenanceTaskPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateMaintenanceTaskInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "maintenance_tasks", &path.task_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TASK_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "maintenance_tasks", &path.task_id, &patch, "id").await?;

    Ok(Json(updated))
}

async fn complete_task(
    State(state): State<AppState>,
    Path(path): Path<MaintenanceTaskPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let task = get_row(pool, "maintenance_tasks", &path.task_id, "id").await?;
    let org_id = value_str(&task, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TASK_EDIT_ROLES).await?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("done".to_string()));
    patch.insert(
        "completed_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );

    let updated = update_row(pool, "maintenance_tasks", &path.task_id, &patch, "id").await?;
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

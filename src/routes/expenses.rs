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
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateExpenseInput,
        ExpensePath, ExpensesQuery, UpdateExpenseInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const EXPENSE_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/expenses",
            axum::routing::get(list_expenses).post(create_expense),
        )
        .route(
            "/expenses/{expense_id}",
            axum::routing::get(get_expense)
                .patch(update_expense)
                .delete(delete_expense),
        )
}

async fn list_expenses(
    State(state): State<AppState>,
    Query(query): Query<ExpensesQuery>,
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
    if let Some(category) = non_empty_opt(query.category.as_deref()) {
        filters.insert("category".to_string(), Value::String(category));
    }
    if let Some(from_date) = non_empty_opt(query.from_date.as_deref()) {
        filters.insert("incurred_on__gte".to_string(), Value::String(from_date));
    }
    if let Some(to_date) = non_empty_opt(query.to_date.as_deref()) {
        filters.insert("incurred_on__lte".to_string(), Value::String(to_date));
    }

    let rows = list_rows(
        pool,
        "expenses",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "incurred_on",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_expense(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateExpenseInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, EXPENSE_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "expenses", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "expenses",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let expense = get_row(pool, "expenses", &path.expense_id, "id").await?;
    let org_id = value_str(&expense, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(expense))
}

async fn update_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateExpenseInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "expenses", &path.expense_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, EXPENSE_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "expenses", &path.expense_id, &patch, "id").await?;

    Ok(Json(updated))
}

async fn delete_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let expense = get_row(pool, "expenses", &path.expense_id, "id").await?;
    let org_id = value_str(&expense, "organization_id");
    assert_org_role(&state, &user_id, &org_id, EXPENSE_EDIT_ROLES).await?;

    let deleted = delete_row(pool, "expenses", &path.expense_id, "id").await?;
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

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

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
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateMortgageInput,
        MortgagePath, OrgScopedQuery, UpdateMortgageInput,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const MORTGAGE_EDIT_ROLES: &[&str] = &["owner_admin", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/mortgages",
            axum::routing::get(list_mortgages).post(create_mortgage),
        )
        .route(
            "/mortgages/{mortgage_id}",
            axum::routing::get(get_mortgage)
                .patch(update_mortgage)
                .delete(delete_mortgage),
        )
}

async fn list_mortgages(
    State(state): State<AppState>,
    Query(query): Query<OrgScopedQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let rows = list_rows(
        pool,
        "mortgages",
        Some(&json_map(&[(
            "organization_id",
            Value::String(query.org_id.clone()),
        )])),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_mortgage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateMortgageInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, MORTGAGE_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let property = get_row(pool, "properties", &payload.property_id, "id").await?;
    if value_str(&property, "organization_id") != payload.organization_id {
        return Err(AppError::BadRequest(
            "property_id does not belong to this organization.".to_string(),
        ));
    }

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "mortgages", &record).await?;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_mortgage(
    State(state): State<AppState>,
    Path(path): Path<MortgagePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mortgage = get_row(pool, "mortgages", &path.mortgage_id, "id").await?;
    let org_id = value_str(&mortgage, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    Ok(Json(mortgage))
}

async fn update_mortgage(
    State(state): State<AppState>,
    Path(path): Path<MortgagePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateMortgageInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "mortgages", &path.mortgage_id, "id").await?;
    let org_id = value_str(&before, "organization_id");
    assert_org_role(&state, &user_id, &org_id, MORTGAGE_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "mortgages", &path.mortgage_id, &patch, "id").await?;

    Ok(Json(updated))
}

async fn delete_mortgage(
    State(state): State<AppState>,
    Path(path): Path<MortgagePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mortgage = get_row(pool, "mortgages", &path.mortgage_id, "id").await?;
    let org_id = value_str(&mortgage, "organization_id");
    assert_org_role(&state, &user_id, &org_id, MORTGAGE_EDIT_ROLES).await?;

    let deleted = delete_row(pool, "mortgages", &path.mortgage_id, "id").await?;
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

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

use crate::{
    auth::{require_user, require_user_id},
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, AcceptOrganizationInviteInput,
        CreateOrganizationInput, CreateOrganizationInviteInput, CreateOrganizationMemberInput,
        OrgMemberPath, OrgPath, UpdateOrganizationInput, UpdateOrganizationMemberInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, ensure_org_membership},
};

const ORG_ADMIN_ROLES: &[&str] = &["owner_admin"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/organizations",
            axum::routing::get(list_organizations).post(create_organization),
        )
        .route(
            "/organizations/{org_id}",
            axum::routing::get(get_organization).patch(update_organization),
        )
        .route(
            "/organizations/{org_id}/members",
            axum::routing::get(list_members).post(add_member),
        )
        .route(
            "/organizations/{org_id}/members/{user_id}",
            axum::routing::patch(update_member).delete(remove_member),
        )
        .route(
            "/organizations/{org_id}/invites",
            axum::routing::get(list_invites).post(create_invite),
        )
        .route(
            "/organizations/invites/accept",
            axum::routing::post(accept_invite),
        )
}

async fn list_organizations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let organizations = crate::tenancy::list_user_organizations(&state, &user_id).await?;
    Ok(Json(json!({ "data": organizations })))
}

async fn create_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateOrganizationInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "owner_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "organizations", &record).await?;
    let org_id = value_str(&created, "id");

    // The creator becomes the owner admin of the new organization.
    ensure_org_membership(&state, &org_id, &user_id, "owner_admin", true).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "create",
        "organizations",
        Some(&org_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &path.org_id).await?;
    let pool = db_pool(&state)?;

    let organization = get_row(pool, "organizations", &path.org_id, "id").await?;
    Ok(Json(organization))
}

async fn update_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateOrganizationInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &path.org_id, ORG_ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "organizations", &path.org_id, "id").await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "organizations", &path.org_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.org_id),
        Some(&user_id),
        "update",
        "organizations",
        Some(&path.org_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn list_members(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &path.org_id).await?;
    let pool = db_pool(&state)?;

    let members = list_rows(
        pool,
        "organization_members",
        Some(&json_map(&[(
            "organization_id",
            Value::String(path.org_id.clone()),
        )])),
        500,
        0,
        "created_at",
        true,
    )
    .await?;

    Ok(Json(json!({ "data": members })))
}

async fn add_member(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateOrganizationMemberInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &path.org_id, ORG_ADMIN_ROLES).await?;

    ensure_org_membership(
        &state,
        &path.org_id,
        &payload.user_id,
        &payload.role,
        payload.is_primary,
    )
    .await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.org_id),
        Some(&user_id),
        "create",
        "organization_members",
        Some(&payload.user_id),
        None,
        None,
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "organization_id": path.org_id, "user_id": payload.user_id })),
    ))
}

async fn update_member(
    State(state): State<AppState>,
    Path(path): Path<OrgMemberPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateOrganizationMemberInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let membership = assert_org_role(&state, &user_id, &path.org_id, ORG_ADMIN_ROLES).await?;

    let role = payload
        .role
        .or_else(|| {
            membership
                .get("role")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| "operator".to_string());

    ensure_org_membership(
        &state,
        &path.org_id,
        &path.user_id,
        &role,
        payload.is_primary.unwrap_or(false),
    )
    .await?;

    Ok(Json(
        json!({ "organization_id": path.org_id, "user_id": path.user_id, "role": role }),
    ))
}

async fn remove_member(
    State(state): State<AppState>,
    Path(path): Path<OrgMemberPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &path.org_id, ORG_ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    if path.user_id == user_id {
        return Err(AppError::BadRequest(
            "You cannot remove your own membership.".to_string(),
        ));
    }

    sqlx::query(
        "DELETE FROM organization_members
         WHERE organization_id = $1::uuid AND user_id = $2::uuid",
    )
    .bind(&path.org_id)
    .bind(&path.user_id)
    .execute(pool)
    .await
    .map_err(crate::error::map_sqlx_error)?;

    state
        .membership_cache
        .invalidate(&format!("{}:{}", path.org_id, path.user_id))
        .await;

    Ok(Json(json!({ "removed": path.user_id })))
}

async fn list_invites(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &path.org_id, ORG_ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    let invites = list_rows(
        pool,
        "organization_invites",
        Some(&json_map(&[(
            "organization_id",
            Value::String(path.org_id.clone()),
        )])),
        200,
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": invites })))
}

async fn create_invite(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateOrganizationInviteInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &path.org_id, ORG_ADMIN_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let token = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(i64::from(payload.expires_in_days.max(1)));

    let mut record = Map::new();
    record.insert(
        "organization_id".to_string(),
        Value::String(path.org_id.clone()),
    );
    record.insert("email".to_string(), Value::String(payload.email.clone()));
    record.insert("role".to_string(), Value::String(payload.role.clone()));
    record.insert("token".to_string(), Value::String(token));
    record.insert(
        "expires_at".to_string(),
        Value::String(expires_at.to_rfc3339()),
    );
    record.insert(
        "invited_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "organization_invites", &record).await?;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn accept_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AcceptOrganizationInviteInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    crate::tenancy::ensure_app_user(&state, &user).await?;
    let pool = db_pool(&state)?;

    let invites = list_rows(
        pool,
        "organization_invites",
        Some(&json_map(&[(
            "token",
            Value::String(payload.token.trim().to_string()),
        )])),
        1,
        0,
        "created_at",
        false,
    )
    .await?;

    let Some(invite) = invites.first() else {
        return Err(AppError::NotFound("Invite not found.".to_string()));
    };

    let expires_at = value_str(invite, "expires_at");
    if !expires_at.is_empty() && expires_at < Utc::now().to_rfc3339() {
        return Err(AppError::BadRequest("Invite has expired.".to_string()));
    }

    let org_id = value_str(invite, "organization_id");
    let mut role = value_str(invite, "role");
    if role.is_empty() {
        role = "operator".to_string();
    }

    ensure_org_membership(&state, &org_id, &user.id, &role, false).await?;

    let invite_id = value_str(invite, "id");
    if !invite_id.is_empty() {
        let _ = delete_row(pool, "organization_invites", &invite_id, "id").await;
    }

    Ok(Json(json!({ "organization_id": org_id, "role": role })))
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

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::auth::require_user;
use crate::error::AppResult;
use crate::state::AppState;
use crate::tenancy::{ensure_app_user, list_user_organizations};

/// Bootstrap endpoint for the UI: upserts the app user row and returns
/// the user together with the organizations they belong to.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let app_user = ensure_app_user(&state, &user).await?;
    let organizations = list_user_organizations(&state, &user.id).await?;

    Ok(Json(json!({
        "user": app_user,
        "organizations": organizations
    })))
}

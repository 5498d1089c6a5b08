use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::state::AppState;

/// Authenticated principal as carried by the access token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub user_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<Value>,
}

/// Resolve the calling user, or reject with 401.
///
/// Outside production an `x-user-id` header may stand in for a real
/// token when DEV_AUTH_OVERRIDES_ENABLED is set.
pub async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(AuthUser {
                id: user_id,
                email: None,
                user_metadata: None,
            });
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;

    let secret = state.config.jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("JWT_SECRET is not configured.".to_string())
    })?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;

    let decoded = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        AppError::Unauthorized(format!("Unauthorized: invalid token ({error})."))
    })?;

    if decoded.claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }

    Ok(AuthUser {
        id: decoded.claims.sub,
        email: decoded.claims.email,
        user_metadata: decoded.claims.user_metadata,
    })
}

pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    Ok(require_user(state, headers).await?.id)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_value(headers, "authorization")?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::bearer_token;
    use axum::http::HeaderMap;

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn rejects_other_schemes_and_empty_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwdw==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer   ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

/// Application-level error taxonomy.
///
/// `Dependency` is the only transient class: it marks infrastructure
/// failures (pool exhaustion, connection reset, statement timeout) that
/// the retry policy may re-attempt. Everything else is permanent and is
/// surfaced to the caller immediately.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Dependency(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Whether a bounded retry may help. Decided here, at the type level,
    /// never by sniffing provider message text.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Dependency(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Dependency(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = %status, detail = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Classify an sqlx failure at the persistence boundary.
pub fn map_sqlx_error(error: sqlx::Error) -> AppError {
    match &error {
        sqlx::Error::RowNotFound => AppError::NotFound("Record not found.".to_string()),
        sqlx::Error::Database(db_error) => {
            let message = db_error.message().to_string();
            tracing::error!(db_error = %message, "Database query failed");
            if db_error.code().as_deref() == Some("23505") {
                AppError::Conflict("Duplicate value violates a unique constraint.".to_string())
            } else {
                AppError::Dependency("Database operation failed.".to_string())
            }
        }
        _ => {
            tracing::error!(db_error = %error, "Database request failed");
            AppError::Dependency("Database request failed.".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dependency_errors_are_transient() {
        assert!(AppError::Dependency("pool timed out".to_string()).is_transient());
        assert!(!AppError::NotFound("missing".to_string()).is_transient());
        assert!(!AppError::BadRequest("bad".to_string()).is_transient());
        assert!(!AppError::Conflict("dup".to_string()).is_transient());
        assert!(!AppError::Internal("boom".to_string()).is_transient());
    }

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            AppError::Unauthorized(String::new()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::UnprocessableEntity(String::new()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::Dependency(String::new()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}

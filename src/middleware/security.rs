use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::state::AppState;

/// Reject requests whose Host header is not on the trusted list.
///
/// A `*` entry disables the check (useful behind a trusted ingress).
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let trusted = &state.config.trusted_hosts;
    if trusted.iter().any(|host| host.trim() == "*") {
        return Ok(next.run(request).await);
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();

    if host.is_empty() || !trusted.iter().any(|candidate| candidate == host) {
        return Err(AppError::BadRequest(format!(
            "Host '{host}' is not trusted."
        )));
    }

    Ok(next.run(request).await)
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map_or(host, |(name, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    })
}

#[cfg(test)]
mod tests {
    use super::strip_port;

    #[test]
    fn strips_numeric_ports_only() {
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("api.rentora.io"), "api.rentora.io");
        assert_eq!(strip_port("[::1]:8000"), "[::1]");
    }
}

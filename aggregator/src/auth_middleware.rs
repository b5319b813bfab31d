//! Authentication middleware for admin endpoints

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::info;

use crate::state::AppState;

pub const METRICS_TOKEN_HEADER: &str = "x-metrics-token";

/// Middleware that requires `x-metrics-token` to match `METRICS_AUTH_TOKEN`.
/// Without a configured token the admin endpoints are closed.
pub async fn metrics_auth(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = app_state.config.metrics_auth_token.as_deref() else {
        info!("Admin request refused: METRICS_AUTH_TOKEN is not set");
        return Err(StatusCode::NOT_FOUND);
    };

    let token = extract_token(&headers)?;
    if token != expected {
        info!("Admin request refused: invalid metrics token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

/// Extract the metrics token header
pub fn extract_token(headers: &HeaderMap) -> Result<&str, StatusCode> {
    headers
        .get(METRICS_TOKEN_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::BAD_REQUEST)
}

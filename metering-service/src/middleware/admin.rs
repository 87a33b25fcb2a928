use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use secrecy::{ExposeSecret, Secret};
use serde_json::json;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

/// Admits a request only when it carries the configured admin key.
/// With no key configured every request is refused.
pub async fn admin_auth_middleware(
    State(admin_api_key): State<Option<Secret<String>>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match (admin_api_key.as_ref(), provided) {
        (Some(expected), Some(key)) if key == expected.expose_secret().as_str() => {
            next.run(request).await
        }
        (None, _) => {
            tracing::warn!("Admin request refused: ADMIN_API_KEY not configured");
            unauthorized()
        }
        _ => {
            tracing::warn!("Failed admin authentication attempt");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized: Invalid or missing admin API key" })),
    )
        .into_response()
}

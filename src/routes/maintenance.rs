use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

/// Degraded-mode router: health and version stay up, everything else is a
/// 503 asking clients to come back later.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(super::health::health_handler))
        .route("/version", get(super::version::version_handler))
        .fallback(maintenance_fallback)
        .layer(axum::middleware::from_fn(crate::pipeline::json_charset))
}

async fn maintenance_fallback() -> Response {
    let body = json!({
        "message": format!(
            "Backups API is down for maintenance v{}",
            env!("CARGO_PKG_VERSION")
        ),
    });
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("10"));
    response
}

use axum::routing::get;
use axum::{Json, Router};

use super::MessageResponse;
use crate::state::AppState;

/// Liveness probe. Never fails and is exempt from fault injection.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = MessageResponse))
)]
pub(crate) async fn health_handler() -> Json<MessageResponse> {
    Json(MessageResponse::ok())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}

pub mod backups;
pub mod health;
pub mod maintenance;
pub mod schema;
pub mod version;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::Router;
use tower_http::compression::CompressionLayer;

use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn ok() -> Self {
        Self {
            message: "Ok".to_string(),
        }
    }
}

async fn fallback_404() -> ApiError {
    ApiError::route_not_found()
}

/// The full request pipeline. Layer order (outermost first): error renderer,
/// init, compression, CORS, body limit, latency injection, random-error
/// injection, routes, 404.
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .merge(health::router())
        .merge(version::router())
        .merge(schema::router())
        .merge(backups::router())
        .fallback(fallback_404);

    let mut app = routes
        .layer(from_fn_with_state(
            state.clone(),
            pipeline::inject_random_errors,
        ))
        .layer(from_fn_with_state(state.clone(), pipeline::inject_latency))
        .layer(DefaultBodyLimit::max(state.config.req_body_size_limit as usize));

    if let Some(cors) = pipeline::cors_layer(&state.config.origin_whitelist) {
        app = app.layer(cors);
    }
    if state.config.compression {
        app = app.layer(CompressionLayer::new());
    }

    app.layer(from_fn_with_state(state.clone(), pipeline::request_init))
        .layer(from_fn_with_state(
            state.clone(),
            pipeline::render_debug_errors,
        ))
        .with_state(state)
}

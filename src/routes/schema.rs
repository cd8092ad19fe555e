use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Enkrypt backups API",
        description = "Signature-authenticated storage for end-to-end-encrypted backups. \
            Error responses carry a machine-readable message: \
            SIGNATURE_DOES_NOT_MATCH_PUBKEY, BACKUP_NOT_FOUND, NO_BACKUPS_FOUND, \
            REQUEST_TIMEOUT, PAYLOAD_TOO_LARGE or INTERNAL_SERVER_ERROR, plus an \
            `errors` array on validation failures."
    ),
    paths(
        super::health::health_handler,
        super::version::version_handler,
        super::backups::list_backups,
        super::backups::get_backup,
        super::backups::create_backup,
        super::backups::delete_backup,
    ),
    components(schemas(
        super::MessageResponse,
        super::version::VersionResponse,
        super::backups::CreateBackupRequest,
        super::backups::BackupListResponse,
        super::backups::BackupResponse,
        crate::error::FieldError,
        crate::keys::Backup,
        crate::keys::BackupSummary,
        crate::keys::UserId,
    ))
)]
struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).expect("OpenAPI document serializes")
}

pub(crate) async fn schema_json() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub(crate) async fn schema_yaml() -> Response {
    match ApiDoc::openapi().to_yaml() {
        Ok(yaml) => ([(header::CONTENT_TYPE, "application/yaml")], yaml).into_response(),
        Err(err) => ApiError::internal(err).into_response(),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/schema", get(schema_json))
        .route("/schema.json", get(schema_json))
        .route("/schema.yml", get(schema_yaml))
        .route("/schema.yaml", get(schema_yaml))
}

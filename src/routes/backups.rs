use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use super::MessageResponse;
use crate::auth::{self, SignedOperation};
use crate::error::{ApiError, ApiResult};
use crate::keys::{
    decode_hex_payload, normalize_hex_payload, timestamp_now, Backup, BackupSummary, PublicKey,
    RecoverableSignature, UserId,
};
use crate::pipeline::{ApiJson, ApiQuery};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SignatureQuery {
    signature: Option<String>,
    // Recognized by the fault-injection stage; tolerated here so the flag
    // does not trip unknown-parameter rejection.
    #[serde(rename = "noInjectErrors")]
    _no_inject_errors: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateBackupRequest {
    /// Hex-encoded opaque payload.
    payload: String,
    /// Alternative transport for the signature; the query parameter wins.
    signature: Option<String>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct BackupListResponse {
    backups: Vec<BackupSummary>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct BackupResponse {
    backup: Backup,
}

fn parse_pubkey(raw: &str) -> ApiResult<PublicKey> {
    PublicKey::parse(raw).map_err(|err| ApiError::bad_request("publicKey", err.to_string()))
}

fn parse_user_id(raw: &str) -> ApiResult<UserId> {
    UserId::parse(raw).map_err(|err| ApiError::bad_request("userId", err.to_string()))
}

fn parse_signature(raw: Option<&str>) -> ApiResult<RecoverableSignature> {
    let raw = raw.ok_or_else(|| ApiError::bad_request("signature", "is required"))?;
    RecoverableSignature::parse(raw)
        .map_err(|err| ApiError::bad_request("signature", err.to_string()))
}

#[utoipa::path(
    get,
    path = "/backups/{publicKey}",
    params(
        ("publicKey" = String, Path, description = "0x-prefixed uncompressed secp256k1 public key"),
        ("signature" = String, Query, description = "Personal-sign signature over the dated list message")
    ),
    responses(
        (status = 200, description = "Summaries, newest first, at most 50", body = BackupListResponse),
        (status = 400, description = "Malformed input or signature mismatch")
    )
)]
pub(crate) async fn list_backups(
    State(state): State<AppState>,
    Path(public_key): Path<String>,
    ApiQuery(query): ApiQuery<SignatureQuery>,
) -> ApiResult<Json<BackupListResponse>> {
    let pubkey = parse_pubkey(&public_key)?;
    let signature = parse_signature(query.signature.as_deref())?;

    let pubkey_hex = pubkey.to_hex();
    auth::verify_ownership(
        &pubkey,
        &signature,
        &SignedOperation::ListBackups {
            pubkey_hex: &pubkey_hex,
        },
        Utc::now(),
    )?;

    let result = state.store.get_user_backups(&pubkey.hash()).await;
    state.metrics.record_storage("list", result.is_ok());
    let backups = result?;
    Ok(Json(BackupListResponse {
        backups: backups.iter().map(Backup::summary).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/backups/{publicKey}/users/{userId}",
    params(
        ("publicKey" = String, Path, description = "0x-prefixed uncompressed secp256k1 public key"),
        ("userId" = String, Path, description = "Lowercase RFC-4122 UUID"),
        ("signature" = String, Query, description = "Personal-sign signature over the dated get message")
    ),
    responses(
        (status = 200, description = "The stored backup", body = BackupResponse),
        (status = 404, description = "BACKUP_NOT_FOUND")
    )
)]
pub(crate) async fn get_backup(
    State(state): State<AppState>,
    Path((public_key, user_id)): Path<(String, String)>,
    ApiQuery(query): ApiQuery<SignatureQuery>,
) -> ApiResult<Json<BackupResponse>> {
    let pubkey = parse_pubkey(&public_key)?;
    let user_id = parse_user_id(&user_id)?;
    let signature = parse_signature(query.signature.as_deref())?;

    auth::verify_ownership(
        &pubkey,
        &signature,
        &SignedOperation::GetBackup { user_id: &user_id },
        Utc::now(),
    )?;

    let result = state.store.get_user_backup(&pubkey.hash(), &user_id).await;
    state.metrics.record_storage("get", result.is_ok());
    let backup = result?.ok_or_else(ApiError::backup_not_found)?;
    Ok(Json(BackupResponse { backup }))
}

#[utoipa::path(
    post,
    path = "/backups/{publicKey}/users/{userId}",
    request_body = CreateBackupRequest,
    responses(
        (status = 200, description = "Created or overwritten", body = MessageResponse),
        (status = 400, description = "Malformed input or signature mismatch"),
        (status = 413, description = "Payload exceeds the body limit")
    )
)]
pub(crate) async fn create_backup(
    State(state): State<AppState>,
    Path((public_key, user_id)): Path<(String, String)>,
    ApiQuery(query): ApiQuery<SignatureQuery>,
    ApiJson(body): ApiJson<CreateBackupRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let pubkey = parse_pubkey(&public_key)?;
    let user_id = parse_user_id(&user_id)?;
    let payload = normalize_hex_payload(&body.payload)
        .map_err(|err| ApiError::bad_request("payload", err.to_string()))?;
    let signature = parse_signature(query.signature.as_deref().or(body.signature.as_deref()))?;

    let payload_bytes = decode_hex_payload(&payload)
        .map_err(|err| ApiError::bad_request("payload", err.to_string()))?;
    auth::verify_ownership(
        &pubkey,
        &signature,
        &SignedOperation::CreateBackup {
            payload: &payload_bytes,
        },
        Utc::now(),
    )?;

    let backup = Backup {
        user_id,
        pubkey: pubkey.to_hex(),
        updated_at: timestamp_now(),
        payload,
    };
    let result = state.store.save_user_backup(&pubkey.hash(), &backup).await;
    state.metrics.record_storage("save", result.is_ok());
    result?;
    Ok(Json(MessageResponse::ok()))
}

#[utoipa::path(
    delete,
    path = "/backups/{publicKey}/users/{userId}",
    params(
        ("signature" = String, Query, description = "Personal-sign signature over the dated delete message")
    ),
    responses(
        (status = 200, description = "Removed; idempotent", body = MessageResponse)
    )
)]
pub(crate) async fn delete_backup(
    State(state): State<AppState>,
    Path((public_key, user_id)): Path<(String, String)>,
    ApiQuery(query): ApiQuery<SignatureQuery>,
) -> ApiResult<Json<MessageResponse>> {
    let pubkey = parse_pubkey(&public_key)?;
    let user_id = parse_user_id(&user_id)?;
    let signature = parse_signature(query.signature.as_deref())?;

    auth::verify_ownership(
        &pubkey,
        &signature,
        &SignedOperation::DeleteBackup { user_id: &user_id },
        Utc::now(),
    )?;

    let result = state
        .store
        .delete_user_backup(&pubkey.hash(), &user_id)
        .await;
    state.metrics.record_storage("delete", result.is_ok());
    result?;
    Ok(Json(MessageResponse::ok()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backups/{publicKey}", get(list_backups))
        .route(
            "/backups/{publicKey}/users/{userId}",
            get(get_backup).post(create_backup).delete(delete_backup),
        )
}

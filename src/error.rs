use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::auth::SignatureMismatch;
use crate::storage::StorageError;

pub const SIGNATURE_DOES_NOT_MATCH_PUBKEY: &str = "SIGNATURE_DOES_NOT_MATCH_PUBKEY";
pub const BACKUP_NOT_FOUND: &str = "BACKUP_NOT_FOUND";
pub const NO_BACKUPS_FOUND: &str = "NO_BACKUPS_FOUND";

/// Machine-readable entry in a 400 response's `errors` array.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest {
        message: String,
        errors: Vec<FieldError>,
    },
    NotFound {
        code: &'static str,
    },
    RequestTimeout,
    PayloadTooLarge,
    Internal {
        source: anyhow::Error,
    },
    /// Fault-injection error; only produced by the random-error middleware.
    Injected {
        status: StatusCode,
    },
}

impl ApiError {
    pub fn bad_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        let message = message.into();
        Self::BadRequest {
            message: format!("Invalid {field}"),
            errors: vec![FieldError { field, message }],
        }
    }

    pub fn validation(errors: Vec<FieldError>) -> Self {
        Self::BadRequest {
            message: "BAD_REQUEST".to_string(),
            errors,
        }
    }

    pub fn signature_mismatch() -> Self {
        Self::BadRequest {
            message: SIGNATURE_DOES_NOT_MATCH_PUBKEY.to_string(),
            errors: vec![FieldError {
                field: "signature".to_string(),
                message: "signature does not recover to the provided public key".to_string(),
            }],
        }
    }

    pub fn backup_not_found() -> Self {
        Self::NotFound {
            code: BACKUP_NOT_FOUND,
        }
    }

    pub fn route_not_found() -> Self {
        Self::NotFound { code: "NOT_FOUND" }
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self::Internal {
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Injected { status } => *status,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BadRequest",
            Self::NotFound { .. } => "NotFound",
            Self::RequestTimeout => "RequestTimeout",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::Internal { .. } => "InternalServerError",
            Self::Injected { .. } => "InjectedError",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest { message, .. } => message.clone(),
            Self::NotFound { code } => (*code).to_string(),
            Self::RequestTimeout => "REQUEST_TIMEOUT".to_string(),
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE".to_string(),
            Self::Internal { .. } => "INTERNAL_SERVER_ERROR".to_string(),
            Self::Injected { .. } => "INJECTED_ERROR".to_string(),
        }
    }

    /// Production body: message plus safe data only.
    pub fn public_body(&self) -> serde_json::Value {
        let mut body = json!({ "message": self.message() });
        match self {
            Self::BadRequest { errors, .. } => {
                body["errors"] = serde_json::to_value(errors).unwrap_or_default();
            }
            Self::Injected { .. } => {
                body["isInjectedError"] = json!(true);
            }
            _ => {}
        }
        body
    }

    /// Debug body: adds the error name, numeric status and the `cause` chain
    /// as a bounded sequence.
    pub fn debug_body(&self) -> serde_json::Value {
        let mut body = self.public_body();
        body["name"] = json!(self.name());
        body["status"] = json!(self.status().as_u16());
        if let Self::Internal { source } = self {
            let causes: Vec<String> = source
                .chain()
                .take(MAX_RENDERED_CAUSES)
                .map(|cause| cause.to_string())
                .collect();
            body["causes"] = json!(causes);
        }
        body
    }
}

const MAX_RENDERED_CAUSES: usize = 8;

/// Stashed on the response so the error-rendering middleware can swap in the
/// debug body when `API_HTTP_DEBUG_ERRORS` is set.
#[derive(Debug, Clone)]
pub struct DebugErrorBody(pub serde_json::Value);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal { source } = &self {
            tracing::error!(err = format!("{source:#}"), "request failed");
        }
        let status = self.status();
        let debug_body = DebugErrorBody(self.debug_body());
        let mut response = (status, Json(self.public_body())).into_response();
        response.extensions_mut().insert(debug_body);
        response
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self::internal(err)
    }
}

impl From<SignatureMismatch> for ApiError {
    fn from(_: SignatureMismatch) -> Self {
        Self::signature_mismatch()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::bad_request("publicKey", "nope").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::backup_not_found().status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::RequestTimeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            ApiError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bad_request_carries_machine_errors() {
        let body = ApiError::bad_request("userId", "must be a lowercase UUID").public_body();
        assert_eq!(body["message"], "Invalid userId");
        assert_eq!(body["errors"][0]["field"], "userId");
        assert_eq!(body["errors"][0]["message"], "must be a lowercase UUID");
    }

    #[test]
    fn signature_mismatch_uses_the_published_code() {
        let body = ApiError::signature_mismatch().public_body();
        assert_eq!(body["message"], SIGNATURE_DOES_NOT_MATCH_PUBKEY);
    }

    #[test]
    fn production_body_hides_causes() {
        let err = ApiError::internal(anyhow::anyhow!("inner").context("outer"));
        let body = err.public_body();
        assert_eq!(body["message"], "INTERNAL_SERVER_ERROR");
        assert!(body.get("causes").is_none());
        assert!(body.get("name").is_none());
    }

    #[test]
    fn debug_body_renders_the_cause_chain() {
        let err = ApiError::internal(anyhow::anyhow!("inner").context("outer"));
        let body = err.debug_body();
        assert_eq!(body["name"], "InternalServerError");
        assert_eq!(body["status"], 500);
        assert_eq!(body["causes"][0], "outer");
        assert_eq!(body["causes"][1], "inner");
    }

    #[test]
    fn injected_errors_are_flagged() {
        let body = ApiError::Injected {
            status: StatusCode::IM_A_TEAPOT,
        }
        .public_body();
        assert_eq!(body["isInjectedError"], true);
    }
}

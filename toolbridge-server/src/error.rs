use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use toolbridge_common::wire::ErrorBody;
use toolbridge_common::{headers, ToolbridgeError};

use crate::store::StoreError;

/// Typed handler errors; the HTTP edge maps each to a status and a JSON
/// body `{error, message?, ...hints}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Tenant(String),

    #[error("{0}")]
    PreconditionRequired(String),

    #[error("epoch mismatch; server epoch is {epoch}")]
    EpochMismatch { epoch: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("gone")]
    Gone,

    #[error("{0}")]
    Conflict(String),

    #[error("version mismatch; server version is {current}")]
    VersionMismatch { current: u64 },

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64, reset_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<ToolbridgeError> for ApiError {
    fn from(e: ToolbridgeError) -> Self {
        match e {
            ToolbridgeError::Validation(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Quoted ETag carrying a row version.
pub fn etag_value(version: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("\"{version}\"")).unwrap_or(HeaderValue::from_static("\"0\""))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(msg) => {
                (StatusCode::UNAUTHORIZED, Json(ErrorBody::new("auth", msg))).into_response()
            }
            ApiError::Tenant(msg) => {
                (StatusCode::FORBIDDEN, Json(ErrorBody::new("tenant_denied", msg))).into_response()
            }
            ApiError::PreconditionRequired(msg) => (
                StatusCode::PRECONDITION_REQUIRED,
                Json(ErrorBody::new("precondition_required", msg)),
            )
                .into_response(),
            ApiError::EpochMismatch { epoch } => {
                let body = ErrorBody {
                    error: "epoch_mismatch".to_string(),
                    message: None,
                    epoch: Some(epoch),
                };
                let mut response = (StatusCode::CONFLICT, Json(body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&epoch.to_string()) {
                    response.headers_mut().insert(headers::SYNC_EPOCH, value);
                }
                response
            }
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody::new("validation", msg))).into_response()
            }
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(ErrorBody::new("not_found", "no such entity")))
                    .into_response()
            }
            ApiError::Gone => {
                (StatusCode::GONE, Json(ErrorBody::new("gone", "entity is deleted")))
                    .into_response()
            }
            ApiError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(ErrorBody::new("conflict", msg))).into_response()
            }
            ApiError::VersionMismatch { current } => {
                let body = ErrorBody::new("version_mismatch", "If-Match does not match");
                let mut response = (StatusCode::PRECONDITION_FAILED, Json(body)).into_response();
                response.headers_mut().insert(header::ETAG, etag_value(current));
                response
            }
            ApiError::RateLimited { retry_after_secs, reset_secs } => {
                let body = ErrorBody::new("rate_limited", "too many requests");
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers_mut = response.headers_mut();
                if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    headers_mut.insert(header::RETRY_AFTER, v);
                }
                headers_mut.insert(headers::RATELIMIT_REMAINING, HeaderValue::from_static("0"));
                if let Ok(v) = HeaderValue::from_str(&reset_secs.to_string()) {
                    headers_mut.insert(headers::RATELIMIT_RESET, v);
                }
                response
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody::new("internal", "internal error")),
                )
                    .into_response()
            }
        }
    }
}

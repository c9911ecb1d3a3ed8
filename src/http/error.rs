//! HTTP error handling and response types.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::EngineError;

/// Response header carrying a group's schedule revision.
pub const REVISION_HEADER: &str = "x-schedule-revision";

static DEV_MODE: AtomicBool = AtomicBool::new(false);

/// Expose internal error details in 500 responses.
pub fn set_dev_mode(enabled: bool) {
    DEV_MODE.store(enabled, Ordering::Relaxed);
}

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Itemized validation conflicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            conflicts: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_conflicts(mut self, conflicts: Value) -> Self {
        self.conflicts = Some(conflicts);
        self
    }
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Domain error from the store or pipelines
    Engine(EngineError),
    /// Missing or unreadable identity headers
    Unauthorized(String),
    /// Malformed request (body, path or query)
    BadRequest(String),
    /// Internal server error
    Internal(String),
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn engine_response(err: EngineError) -> Response {
    let message = err.to_string();
    let (status, body) = match err {
        EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, ApiError::new("NOT_FOUND", message)),
        EngineError::Structural(errors) => (
            StatusCode::BAD_REQUEST,
            ApiError::new("STRUCTURAL_ERROR", message).with_details(json!(errors)),
        ),
        EngineError::Referential(missing) => (
            StatusCode::BAD_REQUEST,
            ApiError::new("REFERENTIAL_ERROR", message).with_details(json!(missing)),
        ),
        EngineError::SchemaMismatch { expected, found } => (
            StatusCode::BAD_REQUEST,
            ApiError::new("SCHEMA_MISMATCH", message)
                .with_details(json!({ "expected": expected, "found": found })),
        ),
        EngineError::LimitExceeded(_) => (StatusCode::BAD_REQUEST, ApiError::new("LIMIT_EXCEEDED", message)),
        EngineError::LockHeld { holder, expires_at } => (
            StatusCode::LOCKED,
            ApiError::new("LOCK_HELD", message)
                .with_details(json!({ "lockedBy": holder, "expiresAt": expires_at })),
        ),
        EngineError::NotLockHolder => (StatusCode::LOCKED, ApiError::new("NOT_LOCK_HOLDER", message)),
        EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, ApiError::new("FORBIDDEN", message)),
        EngineError::RevisionConflict { current } => {
            let body = ApiError::new("REVISION_CONFLICT", message)
                .with_details(json!({ "currentRevision": current }));
            let mut response = (StatusCode::CONFLICT, Json(body)).into_response();
            response
                .headers_mut()
                .insert(REVISION_HEADER, HeaderValue::from(current));
            return response;
        }
        EngineError::Conflicts(list) => (
            StatusCode::BAD_REQUEST,
            ApiError::new("CONFLICTS", message).with_conflicts(to_value(&list)),
        ),
        EngineError::ImportConflicts(rows) => (
            StatusCode::CONFLICT,
            ApiError::new("IMPORT_CONFLICTS", message).with_conflicts(to_value(&rows)),
        ),
        EngineError::ExportValidation(issues) => (
            StatusCode::CONFLICT,
            ApiError::new("EXPORT_VALIDATION_FAILED", message).with_details(to_value(&issues)),
        ),
        EngineError::QueueFull => (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiError::new("SOLVER_QUEUE_FULL", message),
        ),
        EngineError::WalError(_) => return internal_response(message),
    };
    (status, Json(body)).into_response()
}

fn internal_response(detail: String) -> Response {
    tracing::error!("internal error: {detail}");
    let mut body = ApiError::new("INTERNAL_ERROR", "internal server error");
    if DEV_MODE.load(Ordering::Relaxed) {
        body = body.with_details(Value::String(detail));
    }
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Engine(e) => engine_response(e),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, Json(ApiError::new("UNAUTHORIZED", msg))).into_response()
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(ApiError::new("BAD_REQUEST", msg))).into_response()
            }
            AppError::Internal(msg) => internal_response(msg),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        AppError::BadRequest(err.body_text())
    }
}

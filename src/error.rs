//! Structured error types for HTTP responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;

use crate::store::StoreError;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    ValidationFailed,
    InvalidId,

    // Conflict errors
    AlreadyExists,

    // Authorization errors
    Unauthorized,
    Forbidden,

    // Not found errors
    TaskNotFound,
    UserNotFound,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::InvalidId => StatusCode::BAD_REQUEST,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::TaskNotFound | ErrorCode::UserNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Message returned for every unexpected failure. Details go to the log only.
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal server error occurred";

/// Structured error for API responses.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Overrides the status implied by `code` (e.g. 400 for a malformed login email).
    #[serde(skip)]
    status: Option<StatusCode>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            status: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.code.status())
    }

    // Convenience constructors

    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, reason).with_field(field)
    }

    pub fn invalid_id() -> Self {
        Self::new(ErrorCode::InvalidId, "Invalid task id")
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden() -> Self {
        Self::new(ErrorCode::Forbidden, "Not enough permissions")
    }

    pub fn task_not_found() -> Self {
        Self::new(ErrorCode::TaskNotFound, "Task not found")
    }

    pub fn user_not_found() -> Self {
        Self::new(ErrorCode::UserNotFound, "User not found")
    }

    /// Opaque internal error. The cause is logged, never returned.
    pub fn internal(err: impl fmt::Display) -> Self {
        tracing::error!(error = %err, "Internal error");
        Self::new(ErrorCode::InternalError, INTERNAL_ERROR_MESSAGE)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(err) => ApiError::internal(format!("{:#}", err)),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => ApiError::already_exists(message),
            StoreError::Backend(err) => ApiError::internal(format!("{:#}", err)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let challenge = self.code == ErrorCode::Unauthorized;
        let mut response = (status, Json(self)).into_response();
        if challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Result type for API operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_http_status() {
        assert_eq!(ErrorCode::AlreadyExists.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::TaskNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::InvalidId.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_error_hides_cause() {
        let err = ApiError::internal("disk I/O error at /var/db");
        assert_eq!(err.message, INTERNAL_ERROR_MESSAGE);
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("/var/db"));
        assert!(json.contains("INTERNAL_ERROR"));
    }

    #[test]
    fn anyhow_preserves_api_error() {
        let err: anyhow::Error = ApiError::task_not_found().into();
        let api: ApiError = err.into();
        assert_eq!(api.code, ErrorCode::TaskNotFound);
    }

    #[test]
    fn store_conflict_becomes_already_exists() {
        let api: ApiError = StoreError::Conflict("Task already exists".into()).into();
        assert_eq!(api.code, ErrorCode::AlreadyExists);
        assert_eq!(api.message, "Task already exists");
    }

    #[test]
    fn status_override_applies() {
        let err = ApiError::validation("username", "Invalid email format")
            .with_status(StatusCode::BAD_REQUEST);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unauthorized_response_carries_challenge() {
        let response = ApiError::unauthorized("Not authenticated").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }
}

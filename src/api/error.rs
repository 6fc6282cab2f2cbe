use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::DroverError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<DroverError> for ApiError {
    fn from(err: DroverError) -> Self {
        let (status, code) = match &err {
            DroverError::UnknownAgent(_) => (StatusCode::NOT_FOUND, "unknown_agent"),
            DroverError::UnknownTrigger(_) => (StatusCode::BAD_REQUEST, "unknown_trigger"),
            DroverError::BudgetExceeded { .. } => (StatusCode::PAYMENT_REQUIRED, "budget_exceeded"),
            DroverError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            DroverError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            DroverError::DispatchFailed { .. } => (StatusCode::BAD_GATEWAY, "dispatch_failed"),
            DroverError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            DroverError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", err);
        }
        Self::new(status, code, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        DroverError::Storage(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::generator::GenerateError;

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
}

/// JSON error body `{"error": {"message", "type"}}` with a matching status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn internal(error: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "server_error",
            message: format!("{:#}", error),
        }
    }
}

impl From<GenerateError> for ApiError {
    fn from(error: GenerateError) -> Self {
        let (status, kind) = match &error {
            GenerateError::EmptyPrompt | GenerateError::PromptTooLong(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            GenerateError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
            GenerateError::Model(_) | GenerateError::Storage(_) | GenerateError::Join(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "generation_error")
            }
        };
        Self {
            status,
            kind,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{}", self.message);
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.message,
                r#type: self.kind,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

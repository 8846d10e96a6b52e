use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::OrchestratorError;

/// Error body of every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable snake_case label of the underlying error.
    pub code: &'static str,
}

/// [`OrchestratorError`] rendered as an HTTP response.
///
/// | error | status |
/// |---|---|
/// | `NotFound` | 404 |
/// | `ConcurrencyConflict`, `InvalidTransition` | 409 (retry) |
/// | `Configuration` | 422 |
/// | `Store`, `Broker`, `TransientRuntime` | 503 |
/// | anything else | 500 |
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::ConcurrencyConflict { .. }
            | OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::Store(_)
            | OrchestratorError::Broker(_)
            | OrchestratorError::TransientRuntime(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: self.0.as_label(),
        });
        (status, body).into_response()
    }
}

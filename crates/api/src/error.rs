//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation"),
            ApiError::Engine(err) => match err {
                EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                EngineError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                EngineError::InvalidState(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_state"),
                EngineError::RuleViolation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "rule_violation"),
                EngineError::Storage(e) => {
                    error!(error = %e, "storage failure");
                    (StatusCode::INTERNAL_SERVER_ERROR, "storage")
                }
            },
        };

        let mut body = json!({ "error": kind, "message": self.to_string() });
        if let ApiError::Engine(EngineError::RuleViolation(violations)) = &self {
            body["violations"] = json!(violations);
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

//! Error handling for the REST API.
//!
//! Provides the `AppError` type used across all REST endpoints.

use axum::{http::StatusCode, response::IntoResponse, Json};

use crate::pipeline::PipelineError;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => {
                // Log full details server-side, return a generic message.
                tracing::error!(details = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Config(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Game ids double as directory names under `games/` and `processes/`;
/// reject anything that could traverse out of them.
pub fn validate_game_id(id: &str) -> Result<(), AppError> {
    if id.is_empty() || id.len() > 128 {
        return Err(AppError::BadRequest("Invalid game id".into()));
    }
    if id.starts_with('.') {
        return Err(AppError::BadRequest("Invalid game id".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
    {
        return Err(AppError::BadRequest("Invalid game id".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(validate_game_id("Alchemy_Factory").is_ok());
        assert!(validate_game_id("demo-1.2").is_ok());
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(validate_game_id("").is_err());
        assert!(validate_game_id("..").is_err());
        assert!(validate_game_id(".partial-demo").is_err());
        assert!(validate_game_id("a/b").is_err());
        assert!(validate_game_id("a\\b").is_err());
    }
}

//! Registration and API-key authentication.

use axum::{
    extract::{FromRequestParts, State},
    http::request::Parts,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::AppError;
use crate::api::AppState;

pub fn auth_routes() -> Router<AppState> {
    Router::new().route("/register", post(register))
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, AppError> {
    if req.username.is_empty() || req.password.is_empty() {
        return Err(AppError::BadRequest(
            "Missing username or password".into(),
        ));
    }
    if !state.users.register(&req.username, &req.password)? {
        return Err(AppError::Conflict("User already exists".into()));
    }
    tracing::info!(user = %req.username, "user registered");
    Ok(Json(json!({ "status": "ok" })))
}

/// Authenticated user, resolved from the `X-API-Key` header or the
/// `api-key` query parameter.
pub struct AuthedUser(pub String);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| query_param(parts.uri.query().unwrap_or(""), "api-key"));

        let Some(key) = key else {
            return Err(AppError::Unauthorized("Missing API key".into()));
        };
        state
            .users
            .user_for_key(&key)
            .map(AuthedUser)
            .ok_or_else(|| AppError::Unauthorized("Invalid API key".into()))
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_api_key_in_query() {
        assert_eq!(
            query_param("foo=1&api-key=secret", "api-key").as_deref(),
            Some("secret")
        );
        assert_eq!(query_param("foo=1", "api-key"), None);
        assert_eq!(query_param("", "api-key"), None);
    }
}

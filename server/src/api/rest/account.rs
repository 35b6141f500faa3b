//! Account routes: the caller's uploads, key rotation, account removal.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;

use super::auth::AuthedUser;
use super::error::AppError;
use crate::api::AppState;
use crate::pipeline::{GameConfig, CONFIG_NAME};

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/account/games", get(account_games))
        .route("/account/password", post(change_password))
        .route("/account/delete", post(delete_account))
}

async fn account_games(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<Value>, AppError> {
    let games_dir = state.config.games_dir();
    let mut uploaded = Vec::new();

    if games_dir.exists() {
        for entry in fs::read_dir(&games_dir)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || id.starts_with('.') {
                continue;
            }

            let mut name = id.clone();
            let mut owner = None;
            if let Ok(text) = fs::read_to_string(entry.path().join(CONFIG_NAME)) {
                if let Ok(config) = serde_yaml::from_str::<GameConfig>(&text) {
                    owner = config.user;
                    name = config.name;
                }
            }
            if owner.as_deref() == Some(&user.0) {
                uploaded.push(json!({ "id": id, "name": name }));
            }
        }
    }

    Ok(Json(json!({ "games": uploaded })))
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    if req.new_password.is_empty() {
        return Err(AppError::BadRequest("New password required".into()));
    }
    if !state
        .users
        .rotate_key(&user.0, &req.current_password, &req.new_password)?
    {
        return Err(AppError::Forbidden("Invalid password".into()));
    }
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct DeleteAccountRequest {
    current_password: String,
}

async fn delete_account(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(req): Json<DeleteAccountRequest>,
) -> Result<Json<Value>, AppError> {
    if !state.users.remove(&user.0, &req.current_password)? {
        return Err(AppError::Forbidden("Invalid password".into()));
    }
    tracing::info!(user = %user.0, "account deleted");
    Ok(Json(json!({ "status": "ok" })))
}

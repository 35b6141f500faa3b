//! Game library and download routes.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
    routing::{delete, get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;

use super::auth::AuthedUser;
use super::error::{validate_game_id, AppError};
use crate::api::AppState;
use crate::pipeline::{GameConfig, CHUNKS_DIR, CONFIG_NAME, MANIFEST_NAME};

pub fn game_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(check_user))
        .route("/status", get(auth_status))
        .route("/games", get(list_games))
        .route("/games/:id", delete(delete_game))
        .route("/games/:id/config", post(update_config))
        .route("/games/:id/download/manifest.json", get(download_manifest))
        .route("/games/:id/download/config.yaml", get(download_config))
        .route("/games/:id/downloadchunk/:chunk_index", get(download_chunk))
        .route("/games/:id/images/:image_id", get(get_image))
}

async fn check_user(user: AuthedUser) -> Json<Value> {
    Json(json!({ "user": user.0 }))
}

async fn auth_status(user: AuthedUser) -> Json<Value> {
    Json(json!({ "status": format!("{} is authenticated", user.0) }))
}

async fn list_games(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> Result<Json<Value>, AppError> {
    let games_dir = state.config.games_dir();
    let mut games: Vec<String> = Vec::new();
    if games_dir.exists() {
        for entry in fs::read_dir(&games_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && !name.starts_with('.') {
                games.push(name);
            }
        }
    }
    games.sort();
    Ok(Json(json!({ "games": games })))
}

fn game_dir(state: &AppState, id: &str) -> Result<PathBuf, AppError> {
    validate_game_id(id)?;
    let dir = state.config.games_dir().join(id);
    if !dir.is_dir() {
        return Err(AppError::NotFound("Game not found".into()));
    }
    Ok(dir)
}

async fn download_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _user: AuthedUser,
) -> Result<Response, AppError> {
    let path = game_dir(&state, &id)?.join(MANIFEST_NAME);
    let text = fs::read_to_string(&path)
        .map_err(|_| AppError::NotFound("Manifest not found".into()))?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(text))
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn download_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _user: AuthedUser,
) -> Result<Response, AppError> {
    let path = game_dir(&state, &id)?.join(CONFIG_NAME);
    let text = fs::read_to_string(&path)
        .map_err(|_| AppError::NotFound("Config not found".into()))?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/yaml")
        .body(Body::from(text))
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn download_chunk(
    State(state): State<AppState>,
    Path((id, chunk_index)): Path<(String, u32)>,
    _user: AuthedUser,
) -> Result<Response, AppError> {
    let name = format!("chunk_{chunk_index}.tar.xz");
    let path = game_dir(&state, &id)?.join(CHUNKS_DIR).join(&name);

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::NotFound("Chunk not found".into()))?;
    let len = file.metadata().await?.len();

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn get_image(
    State(state): State<AppState>,
    Path((id, image_id)): Path<(String, String)>,
    _user: AuthedUser,
) -> Result<Response, AppError> {
    validate_game_id(&image_id)?;
    let path = game_dir(&state, &id)?
        .join("steamdata")
        .join("images")
        .join(&image_id);
    if !path.is_file() {
        return Err(AppError::NotFound("Image not found".into()));
    }
    let bytes = fs::read(&path)?;
    Response::builder()
        .header(header::CONTENT_TYPE, "image/jpeg")
        .body(Body::from(bytes))
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn delete_game(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _user: AuthedUser,
) -> Result<Json<Value>, AppError> {
    let dir = game_dir(&state, &id)?;
    fs::remove_dir_all(&dir)?;
    tracing::info!(game = %id, "game removed");
    Ok(Json(json!({ "game_id": id, "removed": true })))
}

#[derive(Deserialize)]
struct ConfigForm {
    config: String,
}

async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _user: AuthedUser,
    Form(form): Form<ConfigForm>,
) -> Result<Json<Value>, AppError> {
    let dir = game_dir(&state, &id)?;
    let config = GameConfig::parse(&form.config)?;
    if config.id != id {
        return Err(AppError::BadRequest("Game id mismatch".into()));
    }
    fs::write(dir.join(CONFIG_NAME), config.to_yaml()?)?;
    Ok(Json(json!({ "status": "ok" })))
}

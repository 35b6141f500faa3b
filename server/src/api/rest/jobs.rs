//! Upload and packaging-queue routes.

use axum::{
    extract::{Multipart, State},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use super::auth::AuthedUser;
use super::error::AppError;
use crate::api::AppState;
use crate::pipeline::{GameConfig, ARCHIVE_NAME, CONFIG_NAME};
use crate::queue::JobRecord;

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload_game))
        .route("/download", post(download_game))
        .route("/processes", get(list_process_ids))
        .route("/processes/data", get(process_data))
}

async fn upload_game(
    State(state): State<AppState>,
    user: AuthedUser,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut config: Option<GameConfig> = None;
    let mut archive_written = false;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("config") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                let mut parsed = GameConfig::parse(&text)?;
                parsed.user = Some(user.0.clone());

                let job_dir = state.config.processes_dir().join(&parsed.id);
                tokio::fs::create_dir_all(job_dir.join("work")).await?;
                tokio::fs::write(job_dir.join(CONFIG_NAME), parsed.to_yaml()?).await?;
                config = Some(parsed);
            }
            Some("file") => {
                let Some(config) = config.as_ref() else {
                    return Err(AppError::BadRequest(
                        "config field must precede file".into(),
                    ));
                };
                let dest = state
                    .config
                    .processes_dir()
                    .join(&config.id)
                    .join("work")
                    .join(ARCHIVE_NAME);
                let mut file = tokio::fs::File::create(&dest).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?
                {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                archive_written = true;
            }
            _ => {}
        }
    }

    let Some(config) = config else {
        return Err(AppError::BadRequest("Missing config field".into()));
    };
    if !archive_written {
        return Err(AppError::BadRequest("Missing file field".into()));
    }

    state.queue.enqueue(JobRecord {
        id: config.id.clone(),
        download: 1.0,
        process: 0.0,
        download_url: String::new(),
    })?;
    tracing::info!(game = %config.id, user = %user.0, "upload queued");
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct DownloadForm {
    config: String,
}

async fn download_game(
    State(state): State<AppState>,
    user: AuthedUser,
    Form(form): Form<DownloadForm>,
) -> Result<Json<Value>, AppError> {
    let mut config = GameConfig::parse(&form.config)?;
    let Some(url) = config.url.clone().filter(|u| !u.is_empty()) else {
        return Err(AppError::BadRequest("Config is missing a url".into()));
    };
    config.user = Some(user.0.clone());

    let job_dir = state.config.processes_dir().join(&config.id);
    tokio::fs::create_dir_all(&job_dir).await?;
    tokio::fs::write(job_dir.join(CONFIG_NAME), config.to_yaml()?).await?;

    state.queue.enqueue(JobRecord {
        id: config.id.clone(),
        download: 0.0,
        process: 0.0,
        download_url: url,
    })?;
    tracing::info!(game = %config.id, user = %user.0, "url job queued");
    Ok(Json(json!({ "status": "ok" })))
}

async fn list_process_ids(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> Json<Value> {
    let ids: Vec<String> = state.queue.list().into_iter().map(|j| j.id).collect();
    Json(json!({ "processes": ids }))
}

async fn process_data(State(state): State<AppState>, _user: AuthedUser) -> Json<Value> {
    Json(json!({ "processes": state.queue.list() }))
}

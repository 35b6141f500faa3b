//! The install pipeline.
//!
//! Chunks download sequentially (one in flight) and feed a bounded CPU
//! worker pool that verifies and extracts them; the two phases overlap.
//! Once every chunk is processed, large files are reassembled in the same
//! pool, the tree is installed and verified against the root hash, and
//! saves are restored. Any terminal state wipes the job's staging.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::ApiClient;
use crate::chunkproc::{process_chunk, StagingPaths};
use crate::config::ClientDirs;
use crate::download::{download_stream, DownloadOutcome};
use crate::error::InstallError;
use crate::manifest::{FileEntry, GameConfig, Manifest};
use crate::reassemble::{install_files, merge_large_file};
use crate::saves::{preserve_saves, restore_saves};
use crate::status::{CancelToken, GameState, StatusRegistry};

/// CPU workers for hashing and xz decompression.
fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

pub struct Installer {
    dirs: ClientDirs,
    registry: Arc<StatusRegistry>,
}

impl Installer {
    pub fn new(dirs: ClientDirs) -> Self {
        Self {
            dirs,
            registry: Arc::new(StatusRegistry::new()),
        }
    }

    pub fn registry(&self) -> Arc<StatusRegistry> {
        self.registry.clone()
    }

    /// Start an install job for `game_id`. Returns `false` when a job for
    /// this id is already downloading or processing.
    pub fn start(&self, api: &Arc<ApiClient>, game_id: &str) -> bool {
        let Some(cancel) = self.registry.begin(game_id) else {
            return false;
        };
        let dirs = self.dirs.clone();
        let registry = self.registry.clone();
        let api = api.clone();
        let id = game_id.to_string();
        tokio::spawn(async move {
            run_job(dirs, registry, api, id, cancel).await;
        });
        true
    }

    pub fn stop(&self, game_id: &str) {
        self.registry.stop(game_id);
    }

    #[allow(dead_code)]
    pub fn remove(&self, game_id: &str) {
        self.registry.remove(game_id);
    }

    /// Uninstall: preserve saves, then delete the installed tree. Returns
    /// `false` when the game is not installed.
    pub fn uninstall(&self, game_id: &str) -> anyhow::Result<bool> {
        let game_dir = self.dirs.games().join(game_id);
        if !game_dir.exists() {
            return Ok(false);
        }
        if let Ok(text) = fs::read_to_string(game_dir.join("config.yaml")) {
            if let Ok(config) = GameConfig::parse(&text) {
                preserve_saves(&self.dirs.saves(), game_id, &config, &game_dir)?;
            }
        }
        fs::remove_dir_all(&game_dir)?;
        Ok(true)
    }
}

async fn run_job(
    dirs: ClientDirs,
    registry: Arc<StatusRegistry>,
    api: Arc<ApiClient>,
    id: String,
    cancel: CancelToken,
) {
    let job_dir = dirs.downloads().join(&id);
    match install_game(&dirs, &registry, &api, &id, &cancel).await {
        Ok(true) => {
            registry.mark_completed(&id);
            tracing::info!(game = %id, "install completed");
        }
        Ok(false) => {
            registry.set_state(&id, GameState::Cancelled);
            let _ = fs::remove_dir_all(&job_dir);
            tracing::info!(game = %id, "install cancelled");
        }
        Err(e) => {
            registry.set_error(&id, &e.to_string());
            let _ = fs::remove_dir_all(&job_dir);
            tracing::error!(game = %id, error = %e, "install failed");
        }
    }
}

/// Returns `Ok(false)` when the job was cancelled.
async fn install_game(
    dirs: &ClientDirs,
    registry: &Arc<StatusRegistry>,
    api: &Arc<ApiClient>,
    id: &str,
    cancel: &CancelToken,
) -> Result<bool, InstallError> {
    dirs.ensure_layout()?;
    let job_dir = dirs.downloads().join(id);
    if job_dir.exists() {
        fs::remove_dir_all(&job_dir)?;
    }
    let staging = StagingPaths::new(&job_dir);
    staging.create_all()?;

    let config_text = api.config_text(id).await?;
    fs::write(job_dir.join("config.yaml"), &config_text)?;
    let config = GameConfig::parse(&config_text)?;

    let manifest_text = api.manifest_text(id).await?;
    let manifest = Manifest::parse(&manifest_text)?;
    fs::write(job_dir.join("manifest.json"), &manifest_text)?;

    let files: Arc<HashMap<String, FileEntry>> = Arc::new(
        manifest
            .files
            .iter()
            .map(|f| (f.name.clone(), f.clone()))
            .collect(),
    );
    let large = manifest.large_files();
    let total_bytes = manifest.total_bytes();
    let total_units = manifest.chunks.len() + large.len();
    registry.init_totals(id, total_bytes);

    let semaphore = Arc::new(Semaphore::new(worker_count()));
    let done_units = Arc::new(AtomicUsize::new(0));
    let mut workers: JoinSet<Result<(), InstallError>> = JoinSet::new();
    let mut failure: Option<InstallError> = None;
    let mut bytes_done: u64 = 0;
    let mut processing_started = false;

    for chunk in &manifest.chunks {
        if cancel.is_cancelled() || failure.is_some() {
            break;
        }

        let dest = staging.chunks.join(&chunk.name);
        let url = api.chunk_url(id, chunk.chunk_index);
        let outcome = download_stream(api.http(), &url, api.api_key(), &dest, cancel, |n| {
            bytes_done += n;
            registry.update_download(id, bytes_done, total_bytes);
        })
        .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Let in-flight workers wind down before surfacing the error.
                cancel.cancel();
                failure.get_or_insert(e);
                break;
            }
        };
        if outcome == DownloadOutcome::Cancelled {
            break;
        }

        if !processing_started {
            registry.set_state(id, GameState::Processing);
            processing_started = true;
        }

        let semaphore = semaphore.clone();
        let worker_cancel = cancel.clone();
        let files = files.clone();
        let staging_paths = staging.clone();
        let meta = chunk.clone();
        let registry = registry.clone();
        let done_units = done_units.clone();
        let job_id = id.to_string();
        workers.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| InstallError::State("worker pool closed".into()))?;
            if worker_cancel.is_cancelled() {
                return Ok(());
            }
            tokio::task::spawn_blocking(move || {
                process_chunk(&dest, &meta, &files, &staging_paths)
            })
            .await
            .map_err(|e| InstallError::State(format!("chunk worker failed: {e}")))??;

            let done = done_units.fetch_add(1, Ordering::SeqCst) + 1;
            registry.update_process(&job_id, done as f64 / total_units as f64);
            Ok(())
        });

        // Drain finished workers without blocking the next download.
        while let Some(joined) = workers.try_join_next() {
            if let Err(e) = flatten(joined) {
                // Stop the remaining workers promptly; the failure, not the
                // token, decides the terminal state.
                cancel.cancel();
                failure.get_or_insert(e);
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = flatten(joined) {
            cancel.cancel();
            failure.get_or_insert(e);
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Ok(false);
    }

    // Every chunk is pooled; rebuild the split files.
    if !large.is_empty() {
        let mut merges: JoinSet<Result<(), InstallError>> = JoinSet::new();
        let mut failure: Option<InstallError> = None;
        for meta in &large {
            let semaphore = semaphore.clone();
            let worker_cancel = cancel.clone();
            let tmp_large = staging.tmp_large.clone();
            let items = staging.items.clone();
            let meta = meta.clone();
            let registry = registry.clone();
            let done_units = done_units.clone();
            let job_id = id.to_string();
            merges.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| InstallError::State("worker pool closed".into()))?;
                if worker_cancel.is_cancelled() {
                    return Ok(());
                }
                tokio::task::spawn_blocking(move || {
                    merge_large_file(&meta, &tmp_large, &items)
                })
                .await
                .map_err(|e| InstallError::State(format!("merge worker failed: {e}")))??;

                let done = done_units.fetch_add(1, Ordering::SeqCst) + 1;
                registry.update_process(&job_id, done as f64 / total_units as f64);
                Ok(())
            });
        }
        while let Some(joined) = merges.join_next().await {
            if let Err(e) = flatten(joined) {
                cancel.cancel();
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Ok(false);
        }
    }

    // Install under games/ and verify the whole tree.
    let game_dir = dirs.games().join(id);
    {
        let manifest = manifest.clone();
        let staging_paths = staging.clone();
        let game_dir = game_dir.clone();
        tokio::task::spawn_blocking(move || {
            install_files(&manifest, &staging_paths, &game_dir)
        })
        .await
        .map_err(|e| InstallError::State(format!("install worker failed: {e}")))??;
    }

    fs::rename(job_dir.join("config.yaml"), game_dir.join("config.yaml"))?;
    fs::rename(job_dir.join("manifest.json"), game_dir.join("manifest.json"))?;

    restore_saves(&dirs.saves(), id, &config, &game_dir)?;

    fs::remove_dir_all(&job_dir)?;
    Ok(true)
}

fn flatten(
    joined: Result<Result<(), InstallError>, tokio::task::JoinError>,
) -> Result<(), InstallError> {
    joined.map_err(|e| InstallError::State(format!("worker panicked: {e}")))?
}

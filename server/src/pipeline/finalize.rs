//! Publish stage.
//!
//! Assembles the chunk set, manifest, and config in a partial directory next
//! to the published games and swaps it into place with a single rename, so a
//! client never observes a half-published game.

use std::fs;
use std::path::{Path, PathBuf};

use super::error::PipelineError;
use super::manifest::GameConfig;
use super::{CHUNKS_DIR, CONFIG_NAME, MANIFEST_NAME};
use crate::progress::{ProgressSink, Stage};

pub fn finalize(
    work: &Path,
    games_dir: &Path,
    config: &GameConfig,
    progress: &ProgressSink,
) -> Result<(), PipelineError> {
    fs::create_dir_all(games_dir)?;
    let staging = games_dir.join(format!(".partial-{}", config.id));
    fs::create_dir_all(&staging)?;

    // The chunk set is moved; manifest and config are copied so that a
    // re-entered finalize still finds them in the work directory.
    move_dir(work.join(CHUNKS_DIR), staging.join(CHUNKS_DIR))?;
    fs::copy(work.join(MANIFEST_NAME), staging.join(MANIFEST_NAME))?;
    fs::copy(work.join(CONFIG_NAME), staging.join(CONFIG_NAME))?;
    progress.report(Stage::Finalize, 1, 2);

    if config.is_steam_game && config.get_steam_data {
        if let Err(e) = crate::steam::enrich(&config.id, &staging.join("steamdata")) {
            tracing::warn!(game = %config.id, error = %e, "storefront enrichment failed");
        }
    }

    let dest = games_dir.join(&config.id);
    if dest.exists() {
        fs::remove_dir_all(&dest)?;
    }
    fs::rename(&staging, &dest)?;
    progress.report(Stage::Finalize, 2, 2);
    Ok(())
}

/// Rename `src` to `dst`, tolerating a previous interrupted attempt that
/// already moved it.
fn move_dir(src: PathBuf, dst: PathBuf) -> Result<(), PipelineError> {
    if src.exists() {
        if dst.exists() {
            fs::remove_dir_all(&dst)?;
        }
        fs::rename(&src, &dst)?;
        return Ok(());
    }
    if dst.exists() {
        return Ok(());
    }
    Err(PipelineError::Storage(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("missing pipeline output {}", src.display()),
    )))
}

//! Server-side packaging pipeline.
//!
//! A job's work directory holds the uploaded `data.zip` and `config.yaml`.
//! The pipeline runs `extract → manifest → chunk → finalize` over it and
//! persists a step cursor to `state.json` after each stage, so a restart
//! skips completed stages and re-enters the failed one against fresh stage
//! outputs.

mod chunk;
mod extract;
mod finalize;

pub mod error;
pub mod hash;
pub mod manifest;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use error::PipelineError;
pub use manifest::{GameConfig, Manifest};

use crate::progress::ProgressSink;

pub const ARCHIVE_NAME: &str = "data.zip";
pub const CONFIG_NAME: &str = "config.yaml";
pub const MANIFEST_NAME: &str = "manifest.json";
pub const OUT_DIR: &str = "out";
pub const CHUNKS_DIR: &str = "chunks";
const STATE_NAME: &str = "state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StepState {
    step: u32,
}

fn load_step(work: &Path) -> u32 {
    fs::read_to_string(work.join(STATE_NAME))
        .ok()
        .and_then(|text| serde_json::from_str::<StepState>(&text).ok())
        .map(|state| state.step)
        .unwrap_or(0)
}

fn save_step(work: &Path, step: u32) -> Result<(), PipelineError> {
    let text = serde_json::to_string(&StepState { step })?;
    fs::write(work.join(STATE_NAME), text)?;
    Ok(())
}

/// Run the packaging pipeline for one work directory, publishing the result
/// under `games_dir`.
pub fn run(
    work: &Path,
    games_dir: &Path,
    progress: &ProgressSink,
) -> Result<(), PipelineError> {
    let config_text = fs::read_to_string(work.join(CONFIG_NAME))
        .map_err(|e| PipelineError::Config(format!("cannot read config.yaml: {e}")))?;
    let config = GameConfig::parse(&config_text)?;

    let mut step = load_step(work);
    tracing::info!(game = %config.id, step, "packaging pipeline starting");

    if step < 1 {
        let out = work.join(OUT_DIR);
        if out.exists() {
            fs::remove_dir_all(&out)?;
        }
        extract::extract_archive(&work.join(ARCHIVE_NAME), &out, progress)?;
        save_step(work, 1)?;
        step = 1;
    }

    if step < 2 {
        let built = manifest::build_manifest(&work.join(OUT_DIR), &config, progress)?;
        fs::write(
            work.join(MANIFEST_NAME),
            serde_json::to_string_pretty(&built)?,
        )?;
        save_step(work, 2)?;
        step = 2;
    }

    if step < 3 {
        let text = fs::read_to_string(work.join(MANIFEST_NAME))?;
        let mut built: Manifest = serde_json::from_str(&text)?;
        built.chunks.clear();

        let chunks_dir = work.join(CHUNKS_DIR);
        if chunks_dir.exists() {
            fs::remove_dir_all(&chunks_dir)?;
        }
        chunk::pack_chunks(work, &mut built, progress)?;
        fs::write(
            work.join(MANIFEST_NAME),
            serde_json::to_string_pretty(&built)?,
        )?;
        save_step(work, 3)?;
        step = 3;
    }

    if step < 4 {
        let out = work.join(OUT_DIR);
        if out.exists() {
            fs::remove_dir_all(&out)?;
        }
        finalize::finalize(work, games_dir, &config, progress)?;
        save_step(work, 4)?;
    }

    progress.finish();
    tracing::info!(game = %config.id, "packaging pipeline finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use zip::write::SimpleFileOptions;

    fn write_test_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut writer = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        for (name, content) in entries {
            match content {
                Some(bytes) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(bytes).unwrap();
                }
                None => writer.add_directory(*name, options).unwrap(),
            }
        }
        writer.finish().unwrap();
    }

    fn write_config(work: &Path) {
        fs::write(
            work.join(CONFIG_NAME),
            "name: Demo\nid: demo\nrun: root/demo.exe\n",
        )
        .unwrap();
    }

    #[test]
    fn packages_and_publishes_a_tree() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        write_test_zip(
            &work.join(ARCHIVE_NAME),
            &[
                ("root/", None),
                ("root/a.txt", Some(b"alpha")),
                ("root/sub/b.txt", Some(b"beta")),
                ("root/empty/", None),
            ],
        );
        write_config(&work);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = ProgressSink::new(move |pct| sink_seen.lock().unwrap().push(pct));

        let games = dir.path().join("games");
        run(&work, &games, &sink).unwrap();

        let published = games.join("demo");
        assert!(published.join("chunks/chunk_0.tar.xz").exists());
        assert!(published.join(CONFIG_NAME).exists());

        let manifest: Manifest = serde_json::from_str(
            &fs::read_to_string(published.join(MANIFEST_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.root, "root");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.chunks.len(), 1);
        assert!(manifest
            .folders
            .iter()
            .any(|f| f.path == "root/empty"));

        let samples = seen.lock().unwrap();
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*samples.last().unwrap(), 100);

        assert_eq!(load_step(&work), 4);
        // Re-running a finished job is a no-op.
        run(&work, &games, &ProgressSink::discard()).unwrap();
    }

    #[test]
    fn empty_tree_packages_to_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        write_test_zip(&work.join(ARCHIVE_NAME), &[("root/", None)]);
        write_config(&work);

        let games = dir.path().join("games");
        run(&work, &games, &ProgressSink::discard()).unwrap();

        let manifest: Manifest = serde_json::from_str(
            &fs::read_to_string(games.join("demo").join(MANIFEST_NAME)).unwrap(),
        )
        .unwrap();
        assert!(manifest.files.is_empty());
        assert!(manifest.chunks.is_empty());
        assert_eq!(manifest.folders.len(), 1);
        assert_eq!(manifest.folders[0].path, "root");
        assert_eq!(
            manifest.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn resumes_after_completed_extract_stage() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        write_test_zip(
            &work.join(ARCHIVE_NAME),
            &[("root/", None), ("root/a.txt", Some(b"alpha"))],
        );
        write_config(&work);

        // First stage done, cursor persisted, then the process died.
        let out = work.join(OUT_DIR);
        extract::extract_archive(&work.join(ARCHIVE_NAME), &out, &ProgressSink::discard())
            .unwrap();
        save_step(&work, 1).unwrap();
        // Corrupt the archive: a resumed run must not need it again.
        fs::write(work.join(ARCHIVE_NAME), b"garbage").unwrap();

        let games = dir.path().join("games");
        run(&work, &games, &ProgressSink::discard()).unwrap();
        assert!(games.join("demo").join(MANIFEST_NAME).exists());
    }
}

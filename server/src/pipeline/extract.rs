//! Archive extraction stage.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use super::error::PipelineError;
use crate::progress::{ProgressSink, Stage};

/// Extract `data.zip` into the stage output directory. Entries whose names
/// would escape `out_dir` are skipped.
pub fn extract_archive(
    zip_path: &Path,
    out_dir: &Path,
    progress: &ProgressSink,
) -> Result<(), PipelineError> {
    fs::create_dir_all(out_dir)?;

    let mut archive = zip::ZipArchive::new(File::open(zip_path)?)?;
    let total = archive.len();

    for i in 0..total {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            tracing::warn!(name = entry.name(), "skipping unsafe archive entry");
            continue;
        };
        let dest = out_dir.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            io::copy(&mut entry, &mut out)?;
        }

        progress.report(Stage::Extract, i + 1, total);
    }

    Ok(())
}

//! Large-file reassembly and the final install move-in.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::chunkproc::StagingPaths;
use crate::error::InstallError;
use crate::hashing::{sha256_file, sha256_tree};
use crate::manifest::{FileEntry, Manifest};

/// Parse the integer suffix of `<name>.part<i>`. Part order is this integer,
/// never the lexicographic name ("part10" sorts after "part2").
fn part_index(file_name: &str) -> Option<u64> {
    file_name.rsplit(".part").next()?.parse().ok()
}

/// Concatenate the staged parts of one large file into the items pool and
/// verify the whole-file hash.
pub fn merge_large_file(
    meta: &FileEntry,
    tmp_large: &Path,
    items: &Path,
) -> Result<(), InstallError> {
    let parts_dir = tmp_large.join(&meta.name);
    if !parts_dir.exists() {
        return Err(InstallError::State(format!(
            "missing parts for {}",
            meta.path
        )));
    }

    let mut parts: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&parts_dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = part_index(&file_name) {
            parts.push((index, entry.path()));
        }
    }
    parts.sort_by_key(|p| p.0);

    let output = items.join(&meta.name);
    let mut writer = BufWriter::new(File::create(&output)?);
    for (_, path) in &parts {
        io::copy(&mut File::open(path)?, &mut writer)?;
    }
    writer.flush()?;
    drop(writer);

    if sha256_file(&output)? != meta.hash {
        return Err(InstallError::FileIntegrity {
            path: meta.path.clone(),
        });
    }

    fs::remove_dir_all(&parts_dir)?;
    Ok(())
}

/// Move the reconstructed pool into the game directory: folders first, then
/// every file under its manifest path, then verify the root hash.
pub fn install_files(
    manifest: &Manifest,
    staging: &StagingPaths,
    game_dir: &Path,
) -> Result<(), InstallError> {
    if game_dir.exists() {
        fs::remove_dir_all(game_dir)?;
    }
    fs::create_dir_all(game_dir)?;

    for folder in &manifest.folders {
        fs::create_dir_all(game_dir.join(&folder.path))?;
    }

    for meta in &manifest.files {
        let dest = game_dir.join(&meta.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging.items.join(&meta.name), &dest)?;
    }

    if sha256_tree(&game_dir.join(&manifest.root))? != manifest.hash {
        return Err(InstallError::RootHash);
    }
    Ok(())
}

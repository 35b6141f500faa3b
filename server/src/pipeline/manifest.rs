//! Manifest generation: walk the extracted tree, classify files by size,
//! assign stored names, and compute the root hash.

use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

use super::error::PipelineError;
use super::hash::{sha256_file, sha256_tree, LARGE_FILE_SIZE, PREFERRED_CHUNK_SIZE};
use crate::progress::{ProgressSink, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Small,
    Medium,
    Large,
}

impl Category {
    /// Size classification: >= 32 MiB large, >= 8 MiB medium, else small.
    pub fn of(size: u64) -> Self {
        if size >= LARGE_FILE_SIZE {
            Category::Large
        } else if size >= PREFERRED_CHUNK_SIZE {
            Category::Medium
        } else {
            Category::Small
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from the packaged root, `/`-separated.
    pub path: String,
    /// Stored name: a decimal counter unique within the manifest. Files are
    /// staged and packed under this name, never their path.
    pub name: String,
    pub size: u64,
    pub hash: String,
    pub category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub name: String,
    pub chunk_index: u32,
    /// Stored names contained (small/medium), or the single part filename
    /// (large).
    pub files: Vec<String>,
    /// SHA-256 of the compressed chunk blob.
    pub hash: String,
    pub category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub root: String,
    pub run: String,
    #[serde(rename = "saveInGameFolder")]
    pub save_in_game_folder: bool,
    #[serde(rename = "savePath")]
    pub save_path: Option<String>,
    pub folders: Vec<FolderEntry>,
    pub files: Vec<FileEntry>,
    pub chunks: Vec<ChunkEntry>,
    /// SHA-256 over the sorted file contents beneath `root`.
    pub hash: String,
}

/// The operator-supplied game config. Travels next to the manifest and is
/// preserved in the installed tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub name: String,
    pub id: String,
    pub run: String,
    #[serde(rename = "saveInGameFolder", default)]
    pub save_in_game_folder: bool,
    #[serde(rename = "savePath", default)]
    pub save_path: Option<String>,
    #[serde(rename = "isSteamGame", default)]
    pub is_steam_game: bool,
    #[serde(rename = "getSteamData", default)]
    pub get_steam_data: bool,
    /// Source archive URL, download-flow only.
    #[serde(default)]
    pub url: Option<String>,
    /// Uploading user, stamped by the server.
    #[serde(default)]
    pub user: Option<String>,
}

impl GameConfig {
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let config: GameConfig = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::Config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("config is missing a name".into()));
        }
        if self.id.trim().is_empty() {
            return Err(PipelineError::Config("config is missing an id".into()));
        }
        if self.id.contains(['/', '\\']) || self.id.starts_with('.') {
            return Err(PipelineError::Config(format!(
                "game id {:?} is not a valid directory name",
                self.id
            )));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Build the manifest for an extracted tree. The chunks list is left empty;
/// the packer fills it in. Files are not moved.
pub fn build_manifest(
    out_dir: &Path,
    config: &GameConfig,
    progress: &ProgressSink,
) -> Result<Manifest, PipelineError> {
    // The packaged archive is expected to wrap everything in a single top
    // folder; the root hash covers the first top-level directory in sorted
    // order.
    let mut top_dirs: Vec<String> = std::fs::read_dir(out_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    top_dirs.sort();
    let root = top_dirs.into_iter().next().ok_or_else(|| {
        PipelineError::Config("extracted archive contains no top-level folder".into())
    })?;

    let entries: Vec<walkdir::DirEntry> = WalkDir::new(out_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .collect::<Result<_, _>>()
        .map_err(std::io::Error::from)?;

    let total = entries.len();
    let mut folders = Vec::new();
    let mut files = Vec::new();
    let mut stored_name: u64 = 0;

    for (done, entry) in entries.iter().enumerate() {
        let rel = entry
            .path()
            .strip_prefix(out_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        if entry.file_type().is_dir() {
            folders.push(FolderEntry { path: rel });
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map_err(std::io::Error::from)?.len();
            files.push(FileEntry {
                path: rel,
                name: stored_name.to_string(),
                size,
                hash: sha256_file(entry.path())?,
                category: Category::of(size),
            });
            stored_name += 1;
        }

        progress.report(Stage::Manifest, done + 1, total);
    }

    let hash = sha256_tree(&out_dir.join(&root))?;

    Ok(Manifest {
        name: config.name.clone(),
        root,
        run: config.run.clone(),
        save_in_game_folder: config.save_in_game_folder,
        save_path: config.save_path.clone(),
        folders,
        files,
        chunks: Vec::new(),
        hash,
    })
}

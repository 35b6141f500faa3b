//! Manifest and game-config data types.
//!
//! Mirrors the server's `pipeline/manifest.rs` wire schema exactly.

use serde::{Deserialize, Serialize};

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// Stored name: flat staging key and tar member name.
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
    pub files: Vec<String>,
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
    pub hash: String,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, InstallError> {
        serde_json::from_str(text)
            .map_err(|e| InstallError::Config(format!("malformed manifest: {e}")))
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn large_files(&self) -> Vec<FileEntry> {
        self.files
            .iter()
            .filter(|f| f.category == Category::Large)
            .cloned()
            .collect()
    }
}

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
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl GameConfig {
    pub fn parse(text: &str) -> Result<Self, InstallError> {
        serde_yaml::from_str(text)
            .map_err(|e| InstallError::Config(format!("malformed config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_manifest() {
        let text = r#"{
            "name": "Demo",
            "root": "root",
            "run": "root/demo.exe",
            "saveInGameFolder": true,
            "savePath": "root/saves",
            "folders": [{"path": "root"}],
            "files": [
                {"path": "root/a", "name": "0", "size": 5, "hash": "ab", "category": "small"}
            ],
            "chunks": [
                {"name": "chunk_0.tar.xz", "chunk_index": 0, "files": ["0"], "hash": "cd", "category": "small"}
            ],
            "hash": "ef"
        }"#;
        let manifest = Manifest::parse(text).unwrap();
        assert!(manifest.save_in_game_folder);
        assert_eq!(manifest.files[0].category, Category::Small);
        assert_eq!(manifest.chunks[0].chunk_index, 0);
        assert_eq!(manifest.total_bytes(), 5);
    }

    #[test]
    fn config_defaults_missing_flags_to_false() {
        let config = GameConfig::parse("name: Demo\nid: demo\nrun: x\n").unwrap();
        assert!(!config.save_in_game_folder);
        assert!(config.save_path.is_none());
        assert!(config.url.is_none());
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(Manifest::parse("{").is_err());
        assert!(GameConfig::parse("run: [").is_err());
    }
}

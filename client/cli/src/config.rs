//! Client credentials and on-disk layout.
//!
//! The base directory holds `user.json` next to the three data trees:
//! `downloads/` (ephemeral per-job staging), `games/` (installed trees), and
//! `saves/` (preserved save snapshots).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub ip: String,
}

impl UserConfig {
    pub fn load(dirs: &ClientDirs) -> anyhow::Result<Self> {
        let path = dirs.user_file();
        if !path.exists() {
            anyhow::bail!("Not logged in. Run: depot setup");
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }

    pub fn save(&self, dirs: &ClientDirs) -> anyhow::Result<()> {
        std::fs::write(dirs.user_file(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn delete(dirs: &ClientDirs) -> anyhow::Result<()> {
        let path = dirs.user_file();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// The configured server address as a base url: scheme added when
    /// missing, trailing slashes trimmed.
    pub fn server_url(&self) -> String {
        let mut url = self.ip.trim().to_string();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            url = format!("http://{url}");
        }
        url.trim_end_matches('/').to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ClientDirs {
    base: PathBuf,
}

impl ClientDirs {
    pub fn resolve() -> anyhow::Result<Self> {
        let base = match std::env::var("DEPOT_HOME") {
            Ok(path) => PathBuf::from(path),
            Err(_) => dirs::data_local_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
                .join("depot"),
        };
        std::fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    #[cfg(test)]
    pub fn at(base: &std::path::Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    pub fn downloads(&self) -> PathBuf {
        self.base.join("downloads")
    }

    pub fn games(&self) -> PathBuf {
        self.base.join("games")
    }

    pub fn saves(&self) -> PathBuf {
        self.base.join("saves")
    }

    pub fn user_file(&self) -> PathBuf {
        self.base.join("user.json")
    }

    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [self.downloads(), self.games(), self.saves()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the download and install pipeline. Any of these is fatal
/// to the job it occurs in: the job ends in the `error` state and its staging
/// directory is wiped.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid config or manifest: {0}")]
    Config(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("download truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },

    #[error("chunk {name} failed integrity check")]
    ChunkIntegrity { name: String },

    #[error("file {path} failed integrity check")]
    FileIntegrity { path: String },

    #[error("installed tree does not match the manifest root hash")]
    RootHash,

    #[error("chunk member {name} is not in the manifest")]
    UnknownMember { name: String },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("symlink {0} escapes the tree")]
    Integrity(PathBuf),

    #[error("{0}")]
    State(String),
}

impl From<reqwest::Error> for InstallError {
    fn from(err: reqwest::Error) -> Self {
        InstallError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for InstallError {
    fn from(err: serde_json::Error) -> Self {
        InstallError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for InstallError {
    fn from(err: serde_yaml::Error) -> Self {
        InstallError::Config(err.to_string())
    }
}

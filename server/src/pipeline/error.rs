use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the packaging pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("symlink {0} escapes the packaged tree")]
    Integrity(PathBuf),

    #[error("transfer failed: {0}")]
    Transport(String),

    #[error("download truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

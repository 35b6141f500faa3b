//! Per-game install status registry and cancellation tokens.
//!
//! One mutex guards the whole registry; every read returns a copy. Progress
//! setters are monotone for the lifetime of a job, until a fresh `begin`
//! resets them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameState {
    Idle,
    Downloading,
    Processing,
    Completed,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub id: String,
    pub download: f64,
    pub process: f64,
    pub status: GameState,
    pub error: String,
    pub installed: bool,
    pub bytes_total: u64,
    pub bytes_done: u64,
}

impl DownloadStatus {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            download: 0.0,
            process: 0.0,
            status: GameState::Idle,
            error: String::new(),
            installed: false,
            bytes_total: 0,
            bytes_done: 0,
        }
    }
}

/// Cooperative cancellation flag, checked between network reads and before
/// each processing unit.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Inner {
    statuses: HashMap<String, DownloadStatus>,
    cancels: HashMap<String, CancelToken>,
}

#[derive(Default)]
pub struct StatusRegistry {
    inner: Mutex<Inner>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a game id for a new install. Returns the job's fresh cancel
    /// token, or `None` if an install for this id is already active
    /// (`start` is idempotent while downloading or processing).
    pub fn begin(&self, id: &str) -> Option<CancelToken> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.statuses.get(id) {
            if matches!(
                current.status,
                GameState::Downloading | GameState::Processing
            ) {
                return None;
            }
        }
        let token = CancelToken::default();
        inner.cancels.insert(id.to_string(), token.clone());
        let mut status = DownloadStatus::new(id);
        status.status = GameState::Downloading;
        inner.statuses.insert(id.to_string(), status);
        Some(token)
    }

    pub fn get(&self, id: &str) -> DownloadStatus {
        let inner = self.inner.lock().unwrap();
        inner
            .statuses
            .get(id)
            .cloned()
            .unwrap_or_else(|| DownloadStatus::new(id))
    }

    #[allow(dead_code)]
    pub fn list(&self) -> Vec<DownloadStatus> {
        let inner = self.inner.lock().unwrap();
        inner.statuses.values().cloned().collect()
    }

    /// Fire the job's cancellation token.
    pub fn stop(&self, id: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(token) = inner.cancels.get(id) {
            token.cancel();
        }
    }

    /// Fire the token and forget the job entirely.
    #[allow(dead_code)]
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(token) = inner.cancels.remove(id) {
            token.cancel();
        }
        inner.statuses.remove(id);
    }

    pub fn set_state(&self, id: &str, state: GameState) {
        self.mutate(id, |status| status.status = state);
    }

    pub fn set_error(&self, id: &str, message: &str) {
        self.mutate(id, |status| {
            status.status = GameState::Error;
            status.error = message.to_string();
        });
    }

    pub fn init_totals(&self, id: &str, bytes_total: u64) {
        self.mutate(id, |status| {
            status.bytes_total = bytes_total;
            status.bytes_done = 0;
        });
    }

    pub fn update_download(&self, id: &str, bytes_done: u64, bytes_total: u64) {
        self.mutate(id, |status| {
            status.bytes_done = status.bytes_done.max(bytes_done);
            let fraction = if bytes_total == 0 {
                1.0
            } else {
                (bytes_done as f64 / bytes_total as f64).min(1.0)
            };
            status.download = status.download.max(fraction);
        });
    }

    pub fn update_process(&self, id: &str, fraction: f64) {
        self.mutate(id, |status| {
            status.process = status.process.max(fraction.min(1.0));
        });
    }

    pub fn mark_completed(&self, id: &str) {
        self.mutate(id, |status| {
            status.download = 1.0;
            status.process = 1.0;
            status.status = GameState::Completed;
            status.installed = true;
        });
    }

    fn mutate(&self, id: &str, apply: impl FnOnce(&mut DownloadStatus)) {
        let mut inner = self.inner.lock().unwrap();
        let status = inner
            .statuses
            .entry(id.to_string())
            .or_insert_with(|| DownloadStatus::new(id));
        apply(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_is_idempotent_while_active() {
        let registry = StatusRegistry::new();
        assert!(registry.begin("g").is_some());
        assert!(registry.begin("g").is_none());

        registry.set_state("g", GameState::Processing);
        assert!(registry.begin("g").is_none());

        registry.set_state("g", GameState::Completed);
        assert!(registry.begin("g").is_some());
    }

    #[test]
    fn begin_resets_progress() {
        let registry = StatusRegistry::new();
        registry.begin("g").unwrap();
        registry.update_download("g", 50, 100);
        registry.set_state("g", GameState::Error);

        registry.begin("g").unwrap();
        let status = registry.get("g");
        assert_eq!(status.download, 0.0);
        assert_eq!(status.status, GameState::Downloading);
        assert!(status.error.is_empty());
    }

    #[test]
    fn progress_is_monotone() {
        let registry = StatusRegistry::new();
        registry.begin("g").unwrap();
        registry.update_download("g", 80, 100);
        registry.update_download("g", 40, 100);
        assert_eq!(registry.get("g").download, 0.8);

        registry.update_process("g", 0.5);
        registry.update_process("g", 0.2);
        assert_eq!(registry.get("g").process, 0.5);
    }

    #[test]
    fn stop_fires_the_job_token() {
        let registry = StatusRegistry::new();
        let token = registry.begin("g").unwrap();
        assert!(!token.is_cancelled());
        registry.stop("g");
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_discards_status() {
        let registry = StatusRegistry::new();
        let token = registry.begin("g").unwrap();
        registry.remove("g");
        assert!(token.is_cancelled());
        assert_eq!(registry.get("g").status, GameState::Idle);
    }
}

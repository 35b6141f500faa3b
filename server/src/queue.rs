//! Packaging job queue.
//!
//! Queue state lives in `processes/processes.json` so queued jobs survive a
//! server restart; each job's per-stage progress is persisted by the pipeline
//! cursor in its own work directory. The watchdog loop drains the queue:
//! download the source archive when the job carries a URL, then run the
//! packaging pipeline to completion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;

use crate::api::AppState;
use crate::pipeline::{self, PipelineError, ARCHIVE_NAME, CONFIG_NAME};
use crate::progress::ProgressSink;

const QUEUE_NAME: &str = "processes.json";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Consecutive failures before a job is dropped from the queue.
const MAX_JOB_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub download: f64,
    pub process: f64,
    pub download_url: String,
}

pub struct JobQueue {
    path: PathBuf,
    jobs: Mutex<Vec<JobRecord>>,
}

impl JobQueue {
    pub fn open(processes_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(processes_dir)?;
        let path = processes_dir.join(QUEUE_NAME);
        let jobs: Vec<JobRecord> = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        let queue = Self {
            path,
            jobs: Mutex::new(jobs),
        };
        queue.persist(&queue.jobs.lock().unwrap())?;
        Ok(queue)
    }

    pub fn list(&self) -> Vec<JobRecord> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    /// Add a job, replacing any queued job with the same id.
    pub fn enqueue(&self, job: JobRecord) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|j| j.id != job.id);
        jobs.push(job);
        self.persist(&jobs)
    }

    pub fn set_download(&self, id: &str, value: f64) -> anyhow::Result<()> {
        self.update(id, |job| job.download = round3(value))
    }

    pub fn set_process(&self, id: &str, value: f64) -> anyhow::Result<()> {
        self.update(id, |job| job.process = round3(value))
    }

    pub fn remove(&self, id: &str) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|j| j.id != id);
        self.persist(&jobs)
    }

    pub fn prune_completed(&self) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| !(j.download >= 1.0 && j.process >= 1.0));
        if jobs.len() != before {
            self.persist(&jobs)?;
        }
        Ok(())
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut JobRecord)) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            apply(job);
            self.persist(&jobs)?;
        }
        Ok(())
    }

    fn persist(&self, jobs: &[JobRecord]) -> anyhow::Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(jobs)?)?;
        Ok(())
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Poll the queue and drive jobs to completion, forever.
pub async fn run_watchdog(state: AppState) {
    let mut failures: HashMap<String, u32> = HashMap::new();
    loop {
        if let Err(e) = tick(&state, &mut failures).await {
            tracing::error!(error = %e, "watchdog tick failed");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn tick(state: &AppState, failures: &mut HashMap<String, u32>) -> anyhow::Result<()> {
    state.queue.prune_completed()?;

    for job in state.queue.list() {
        let id = job.id.clone();
        match run_job(state, job).await {
            Ok(()) => {
                failures.remove(&id);
            }
            Err(e) => {
                tracing::error!(game = %id, error = %e, "packaging job failed");
                let count = failures.entry(id.clone()).or_insert(0);
                *count += 1;
                if *count >= MAX_JOB_ATTEMPTS {
                    tracing::warn!(
                        game = %id,
                        attempts = MAX_JOB_ATTEMPTS,
                        "dropping job after repeated failures"
                    );
                    state.queue.remove(&id)?;
                    let _ = fs::remove_dir_all(state.config.processes_dir().join(&id));
                    failures.remove(&id);
                }
            }
        }
    }
    Ok(())
}

async fn run_job(state: &AppState, job: JobRecord) -> anyhow::Result<()> {
    let id = job.id.clone();
    let job_dir = state.config.processes_dir().join(&id);
    let work = job_dir.join("work");
    fs::create_dir_all(&work)?;

    if job.download < 1.0 {
        tracing::info!(game = %id, url = %job.download_url, "downloading source archive");
        download_archive(state, &job, &work).await?;
        state.queue.set_download(&id, 1.0)?;
    }

    let Some(job) = state.queue.get(&id) else {
        return Ok(());
    };

    if job.process < 1.0 {
        let submitted = job_dir.join(CONFIG_NAME);
        let staged = work.join(CONFIG_NAME);
        if !staged.exists() {
            fs::copy(&submitted, &staged)?;
        }

        let games_dir = state.config.games_dir();
        let queue = state.queue.clone();
        let progress_id = id.clone();
        let sink = ProgressSink::new(move |pct| {
            let _ = queue.set_process(&progress_id, f64::from(pct) / 100.0);
        });

        tracing::info!(game = %id, "running packaging pipeline");
        let work_dir = work.clone();
        tokio::task::spawn_blocking(move || pipeline::run(&work_dir, &games_dir, &sink))
            .await??;
        state.queue.set_process(&id, 1.0)?;
    }

    let done = state
        .queue
        .get(&id)
        .map(|j| j.download >= 1.0 && j.process >= 1.0)
        .unwrap_or(false);
    if done {
        state.queue.remove(&id)?;
        let _ = fs::remove_dir_all(&job_dir);
        tracing::info!(game = %id, "packaging job complete");
    }
    Ok(())
}

/// Stream the job's source archive into `work/data.zip`, reporting byte
/// progress against the declared content length.
async fn download_archive(
    state: &AppState,
    job: &JobRecord,
    work: &Path,
) -> anyhow::Result<()> {
    if job.download_url.is_empty() {
        anyhow::bail!("job {} has no archive and no download url", job.id);
    }

    let dest = work.join(ARCHIVE_NAME);
    if dest.exists() {
        fs::remove_file(&dest)?;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(30))
        .build()?;
    let response = client
        .get(&job.download_url)
        .send()
        .await?
        .error_for_status()?;
    let total = response.content_length();

    let mut file = tokio::fs::File::create(&dest).await?;
    let mut stream = response.bytes_stream();
    let mut done: u64 = 0;

    while let Some(chunk) = stream.try_next().await? {
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;
        if let Some(total) = total.filter(|t| *t > 0) {
            state
                .queue
                .set_download(&job.id, (done as f64 / total as f64).min(1.0))?;
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = total {
        let actual = fs::metadata(&dest)?.len();
        if actual != expected {
            let _ = fs::remove_file(&dest);
            return Err(PipelineError::Truncated {
                expected,
                got: actual,
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> JobRecord {
        JobRecord {
            id: id.into(),
            download: 0.0,
            process: 0.0,
            download_url: String::new(),
        }
    }

    #[test]
    fn queue_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path()).unwrap();
        queue.enqueue(job("a")).unwrap();
        queue.enqueue(job("b")).unwrap();
        queue.set_download("a", 0.5).unwrap();

        let reloaded = JobQueue::open(dir.path()).unwrap();
        let jobs = reloaded.list();
        assert_eq!(jobs.len(), 2);
        assert_eq!(reloaded.get("a").unwrap().download, 0.5);
    }

    #[test]
    fn enqueue_replaces_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path()).unwrap();
        queue.enqueue(job("a")).unwrap();
        let mut again = job("a");
        again.download_url = "http://example/data.zip".into();
        queue.enqueue(again).unwrap();

        let jobs = queue.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].download_url, "http://example/data.zip");
    }

    #[test]
    fn prune_drops_only_completed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path()).unwrap();
        queue.enqueue(job("pending")).unwrap();
        let mut finished = job("finished");
        finished.download = 1.0;
        finished.process = 1.0;
        queue.enqueue(finished).unwrap();

        queue.prune_completed().unwrap();
        let ids: Vec<String> = queue.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["pending"]);
    }

    #[test]
    fn progress_values_are_rounded() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path()).unwrap();
        queue.enqueue(job("a")).unwrap();
        queue.set_process("a", 0.123456).unwrap();
        assert_eq!(queue.get("a").unwrap().process, 0.123);
    }
}

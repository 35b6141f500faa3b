//! Daemon lifecycle: pid-file bookkeeping, liveness probing, and
//! signal-based shutdown for the background server.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Owns the daemon's pid file. All lifecycle questions ("is it up", "stop
/// it", "launch it detached") go through this handle, so a stale file never
/// outlives the process it described.
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn for_service(name: &str) -> Self {
        let dir = dirs::runtime_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: dir.join(format!("{name}.pid")),
        }
    }

    /// Pid of the live daemon, if any. A recorded pid whose process has
    /// exited is treated as absent and the file is discarded.
    pub fn live_pid(&self) -> Option<u32> {
        let pid = fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse::<u32>()
            .ok()?;
        if process_alive(pid) {
            return Some(pid);
        }
        self.clear();
        None
    }

    pub fn record(&self, pid: u32) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, pid.to_string())
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// Re-exec this binary detached with `args` and record the child's pid.
    pub fn spawn_detached(&self, args: &[&str]) -> anyhow::Result<u32> {
        let child = Command::new(std::env::current_exe()?)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();
        self.record(pid)?;
        Ok(pid)
    }

    /// Ask the recorded daemon to exit. Returns the pid that was signalled,
    /// or `None` when nothing was running.
    pub fn terminate(&self) -> anyhow::Result<Option<u32>> {
        let Some(pid) = self.live_pid() else {
            return Ok(None);
        };
        signal_exit(pid)?;
        self.clear();
        Ok(Some(pid))
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without touching the process.
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; trust the recorded pid.
    true
}

#[cfg(unix)]
fn signal_exit(pid: u32) -> anyhow::Result<()> {
    let status = Command::new("kill").arg(pid.to_string()).status()?;
    if !status.success() {
        anyhow::bail!("failed to signal pid {pid}");
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_exit(pid: u32) -> anyhow::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()?;
    if !status.success() {
        anyhow::bail!("failed to signal pid {pid}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pidfile_in(dir: &std::path::Path) -> Pidfile {
        Pidfile {
            path: dir.join("depotd.pid"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn live_pid_reports_a_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = pidfile_in(dir.path());
        // Our own pid is certainly alive.
        pidfile.record(std::process::id()).unwrap();
        assert_eq!(pidfile.live_pid(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn stale_pid_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = pidfile_in(dir.path());
        // Pids near the 32-bit cap are far beyond any default pid_max.
        pidfile.record(u32::MAX - 1).unwrap();
        assert_eq!(pidfile.live_pid(), None);
        assert!(!dir.path().join("depotd.pid").exists());
    }

    #[test]
    fn unreadable_or_missing_file_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = pidfile_in(dir.path());
        assert_eq!(pidfile.live_pid(), None);

        fs::write(dir.path().join("depotd.pid"), "not a pid").unwrap();
        assert_eq!(pidfile.live_pid(), None);
    }
}

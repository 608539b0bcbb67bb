//! OS process supervision behind a platform-neutral trait.
//!
//! The pool manager only sees [`ProcessSupervisor`]. [`OsProcessSupervisor`]
//! launches worker processes with `tokio::process` and uses signals on unix
//! (`SIGTERM`, then `SIGKILL` after the grace period) and process termination
//! on windows.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;

use super::worker::WorkerType;

/// Interval between liveness probes while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised while managing worker processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker executable could not be started.
    #[error("Failed to spawn {worker_type} worker: {source}")]
    SpawnFailed {
        worker_type: WorkerType,
        #[source]
        source: std::io::Error,
    },

    /// The process started but exited before its pid could be read.
    #[error("Spawned {0} worker exited before reporting a pid")]
    MissingPid(WorkerType),

    /// Signalling or killing the process failed.
    #[error("Failed to terminate process {pid}: {reason}")]
    TerminateFailed { pid: u32, reason: String },

    /// The worker program could not be resolved.
    #[error("Cannot resolve worker program: {0}")]
    ProgramUnavailable(String),
}

/// Starts, stops and probes worker processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Starts a worker process for `worker_type` and returns its pid.
    async fn spawn(&self, worker_type: WorkerType, worker_id: &str) -> Result<u32, SupervisorError>;

    /// Asks the process to exit and force-kills it once `grace` has elapsed.
    ///
    /// Terminating a process that is already gone succeeds without doing
    /// anything.
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<(), SupervisorError>;

    /// Returns whether the process is still running.
    async fn is_alive(&self, pid: u32) -> bool;
}

/// [`ProcessSupervisor`] backed by real OS processes.
///
/// Each worker runs `{program} {args...} --id {worker_id} --type {type}`.
/// Children spawned by this supervisor are kept so they can be reaped; pids
/// adopted from a previous master are probed and signalled through the OS.
pub struct OsProcessSupervisor {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    children: Mutex<HashMap<u32, Child>>,
}

impl OsProcessSupervisor {
    /// Creates a supervisor launching `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a supervisor from the configured worker program, defaulting to
    /// the current executable. Connection settings are forwarded to the
    /// children through the environment.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, SupervisorError> {
        let program = match config.worker_program {
            Some(ref program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| SupervisorError::ProgramUnavailable(e.to_string()))?,
        };

        let mut supervisor = Self::new(program, config.worker_args.clone())
            .with_env("REDIS_URL", &config.redis_url)
            .with_env("DIALER_KEY_PREFIX", &config.key_prefix);
        if let Some(ref url) = config.database_url {
            supervisor = supervisor.with_env("DATABASE_URL", url);
        }
        Ok(supervisor)
    }

    /// Adds an environment variable passed to every spawned worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Checks an owned child first so exited children are reaped instead of
    /// lingering as zombies that still answer liveness probes.
    async fn reap(&self, pid: u32) -> Option<bool> {
        let mut children = self.children.lock().await;
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, status = %status, "Worker process exited");
                children.remove(&pid);
                Some(false)
            }
            Ok(None) => Some(true),
            Err(e) => {
                warn!(pid, error = %e, "Failed to poll worker process");
                None
            }
        }
    }

    async fn wait_for_exit(&self, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.is_alive(pid).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    async fn request_exit(&self, pid: u32) -> Result<(), SupervisorError> {
        send_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(unix)]
    async fn force_kill(&self, pid: u32) -> Result<(), SupervisorError> {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(windows)]
    async fn request_exit(&self, pid: u32) -> Result<(), SupervisorError> {
        // Windows has no cooperative signal for a detached console process;
        // taskkill without /F posts WM_CLOSE, which workers may ignore.
        run_taskkill(pid, false).await
    }

    #[cfg(windows)]
    async fn force_kill(&self, pid: u32) -> Result<(), SupervisorError> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&pid) {
            return child.start_kill().map_err(|e| SupervisorError::TerminateFailed {
                pid,
                reason: e.to_string(),
            });
        }
        drop(children);
        run_taskkill(pid, true).await
    }

    #[cfg(not(any(unix, windows)))]
    async fn request_exit(&self, pid: u32) -> Result<(), SupervisorError> {
        self.force_kill(pid).await
    }

    #[cfg(not(any(unix, windows)))]
    async fn force_kill(&self, pid: u32) -> Result<(), SupervisorError> {
        let mut children = self.children.lock().await;
        match children.get_mut(&pid) {
            Some(child) => child.start_kill().map_err(|e| SupervisorError::TerminateFailed {
                pid,
                reason: e.to_string(),
            }),
            None => Err(SupervisorError::TerminateFailed {
                pid,
                reason: "process not owned by this supervisor".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ProcessSupervisor for OsProcessSupervisor {
    async fn spawn(&self, worker_type: WorkerType, worker_id: &str) -> Result<u32, SupervisorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--id")
            .arg(worker_id)
            .arg("--type")
            .arg(worker_type.as_str())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        let child = command
            .spawn()
            .map_err(|source| SupervisorError::SpawnFailed { worker_type, source })?;
        let pid = child.id().ok_or(SupervisorError::MissingPid(worker_type))?;

        self.children.lock().await.insert(pid, child);
        info!(pid, worker_id = %worker_id, worker_type = %worker_type, "Spawned worker process");
        Ok(pid)
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> Result<(), SupervisorError> {
        if !self.is_alive(pid).await {
            self.children.lock().await.remove(&pid);
            return Ok(());
        }

        self.request_exit(pid).await?;
        if self.wait_for_exit(pid, grace).await {
            debug!(pid, "Worker exited within grace period");
            return Ok(());
        }

        warn!(pid, grace_secs = grace.as_secs_f64(), "Worker ignored shutdown request, killing");
        self.force_kill(pid).await?;
        if !self.wait_for_exit(pid, grace.max(Duration::from_secs(1))).await {
            return Err(SupervisorError::TerminateFailed {
                pid,
                reason: "process still alive after forced kill".to_string(),
            });
        }
        Ok(())
    }

    async fn is_alive(&self, pid: u32) -> bool {
        match self.reap(pid).await {
            Some(alive) => alive,
            None => is_process_running(pid).await,
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // pid 0 and negative pids address process groups.
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| SupervisorError::TerminateFailed {
            pid,
            reason: "pid out of range".to_string(),
        })?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::TerminateFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(unix)]
async fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
async fn is_process_running(pid: u32) -> bool {
    let output = Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .await;
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()),
        Err(_) => false,
    }
}

#[cfg(windows)]
async fn run_taskkill(pid: u32, force: bool) -> Result<(), SupervisorError> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str()];
    if force {
        args.push("/F");
    }
    let status = Command::new("taskkill")
        .args(&args)
        .status()
        .await
        .map_err(|e| SupervisorError::TerminateFailed {
            pid,
            reason: e.to_string(),
        })?;
    if status.success() || !is_process_running(pid).await {
        Ok(())
    } else {
        Err(SupervisorError::TerminateFailed {
            pid,
            reason: format!("taskkill exited with {}", status),
        })
    }
}

#[cfg(not(any(unix, windows)))]
async fn is_process_running(_pid: u32) -> bool {
    false
}

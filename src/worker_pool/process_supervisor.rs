// ABOUTME: Worker process supervision: spawn, exit watching, and staged termination
//
// Each spawned worker gets a watcher task that owns the Child. The watcher reports
// how the process ended and performs termination on request (grace wait, SIGTERM,
// SIGKILL). Also resolves the worker executable and computes restart backoff.

#![allow(clippy::missing_const_for_fn)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Errors that can occur during process supervision
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Process spawn failed
    #[error("Failed to spawn {path}: {source}")]
    SpawnFailed {
        /// Executable that could not be started
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Invalid command
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Process exited with an exit code
    Exited {
        /// Exit code from the process
        code: i32,
    },

    /// Process was terminated by a signal
    Signaled {
        /// Signal number that terminated the process
        signal: i32,
    },

    /// Waiting on the process failed
    Failed {
        /// Description of the failure
        reason: String,
    },
}

impl ProcessExit {
    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Self::Failed {
                    reason: format!("wait failed: {e}"),
                }
            }
        };

        if let Some(code) = status.code() {
            return Self::Exited { code };
        }

        if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(&status) {
            return Self::Signaled { signal };
        }

        Self::Failed {
            reason: "Unknown termination".to_string(),
        }
    }

    /// Whether the process ended with exit code 0
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Exponential backoff calculator for restart delays
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `max`
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_attempt: 0,
        }
    }

    /// `min(base * 2^attempt, max)`, then advance the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.current_attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        self.current_attempt = self.current_attempt.saturating_add(1);

        std::cmp::min(delay, self.max)
    }

    /// Start over from `base` (called once a worker connects)
    pub const fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Delays handed out since the last reset
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Find the worker executable.
///
/// Paths containing a separator are used as given. Bare names are looked up
/// in the directory of the running executable, then in `search_dirs`, then on
/// `PATH`. If nothing matches the bare name is returned so the spawn fails
/// with a meaningful error.
pub fn resolve_executable(name: &str, search_dirs: &[PathBuf]) -> PathBuf {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.to_path_buf();
    }

    let app_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    for dir in app_dir.iter().chain(search_dirs) {
        let path = dir.join(name);
        if path.is_file() {
            debug!(path = %path.display(), "Resolved worker executable");
            return path;
        }
    }

    match which::which(name) {
        Ok(path) => {
            debug!(path = %path.display(), "Resolved worker executable on PATH");
            path
        }
        Err(_) => {
            warn!(name = %name, "Worker executable not found, using bare name");
            candidate.to_path_buf()
        }
    }
}

/// How the watcher should stop its process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL if still alive after `grace`
    Terminate {
        /// Time allowed after SIGTERM
        grace: Duration,
    },
    /// Wait `grace` for a voluntary exit, then escalate like `Terminate`
    Shutdown {
        /// Time allowed at each step
        grace: Duration,
    },
}

/// A running worker process and the control line to its watcher task.
///
/// Dropping it without calling [`WorkerProcess::stop`] kills the process.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: u32,
    control: Option<oneshot::Sender<StopMode>>,
    watcher: tokio::task::JoinHandle<ProcessExit>,
}

impl WorkerProcess {
    /// Spawn `executable` with the endpoint address as its only argument.
    ///
    /// stdin is null; stdout and stderr are inherited. `on_exit` runs on the
    /// watcher task once the process has ended for any reason.
    pub fn spawn<F>(
        executable: &Path,
        endpoint: &Path,
        env: &HashMap<String, String>,
        on_exit: F,
    ) -> Result<Self, SupervisorError>
    where
        F: FnOnce(ProcessExit) + Send + 'static,
    {
        if executable.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidCommand(
                "Command cannot be empty".to_string(),
            ));
        }

        let mut command = Command::new(executable);
        command
            .arg(endpoint)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| SupervisorError::SpawnFailed {
            path: executable.to_path_buf(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        info!(pid, path = %executable.display(), "Worker process spawned");

        let (control, control_rx) = oneshot::channel();
        let watcher = tokio::spawn(async move {
            let exit = watch(child, pid, control_rx).await;
            on_exit(exit.clone());
            exit
        });

        Ok(Self {
            pid,
            control: Some(control),
            watcher,
        })
    }

    /// OS process id (0 if unknown)
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the watcher to stop the process. Only the first call has an effect.
    pub fn stop(&mut self, mode: StopMode) {
        if let Some(control) = self.control.take() {
            // Watcher already gone means the process already exited
            let _ = control.send(mode);
        }
    }

    /// Stop the process and wait for it to be reaped.
    pub async fn stop_and_wait(mut self, mode: StopMode) -> ProcessExit {
        self.stop(mode);
        match (&mut self.watcher).await {
            Ok(exit) => exit,
            Err(e) => ProcessExit::Failed {
                reason: format!("watcher task failed: {e}"),
            },
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Closing the control channel without a mode makes the watcher kill the process
        self.control.take();
    }
}

async fn watch(mut child: Child, pid: u32, control: oneshot::Receiver<StopMode>) -> ProcessExit {
    let exit = tokio::select! {
        status = child.wait() => ProcessExit::from_status(status),
        mode = control => match mode {
            Ok(mode) => stop_child(&mut child, pid, mode).await,
            Err(_) => kill(&mut child, pid).await,
        },
    };

    if exit.is_clean() {
        debug!(pid, "Worker process exited cleanly");
    } else {
        info!(pid, exit = %exit, "Worker process ended");
    }
    exit
}

async fn stop_child(child: &mut Child, pid: u32, mode: StopMode) -> ProcessExit {
    let grace = match mode {
        StopMode::Shutdown { grace } => {
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return ProcessExit::from_status(status);
            }
            debug!(pid, "Worker did not exit on its own, terminating");
            grace
        }
        StopMode::Terminate { grace } => grace,
    };

    terminate(child, pid, grace).await
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> ProcessExit {
    use nix::sys::signal::{kill as send_signal, Signal};
    use nix::unistd::Pid;

    info!(pid, "Terminating worker process");

    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => {
            let _ = send_signal(Pid::from_raw(raw), Signal::SIGTERM);
        }
        _ => return kill(child, pid).await,
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(pid, "Worker terminated gracefully");
            ProcessExit::from_status(status)
        }
        Err(_) => {
            warn!(pid, "Worker did not terminate gracefully, sending SIGKILL");
            kill(child, pid).await
        }
    }
}

async fn kill(child: &mut Child, pid: u32) -> ProcessExit {
    if let Err(e) = child.start_kill() {
        error!(pid, error = %e, "Failed to kill worker process");
    }
    ProcessExit::from_status(child.wait().await)
}

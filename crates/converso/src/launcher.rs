//! Module process launcher.
//!
//! Starts a module entry point with piped stdio and owns the child until it is
//! terminated. Termination is graceful first (SIGTERM to the module's process
//! group on unix), then forced, and every wait is bounded.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Environment variable naming an explicit interpreter.
pub const INTERPRETER_ENV: &str = "CONVERSO_PYTHON";

/// Interpreter names tried on `PATH`, in order.
pub const INTERPRETER_CANDIDATES: &[&str] = &["python3", "python", "python.exe"];

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("entry point not found: {}", .0.display())]
    EntryPointNotFound(PathBuf),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("module {0} was not captured")]
    StreamNotCaptured(&'static str),
}

/// Waits applied by [`ProcessHandle::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateGrace {
    /// How long to wait after SIGTERM before forcing.
    pub term: Duration,
    /// How long to wait after the forced kill before giving up on reaping.
    pub kill: Duration,
}

impl Default for TerminateGrace {
    fn default() -> Self {
        Self {
            term: Duration::from_millis(500),
            kill: Duration::from_secs(2),
        }
    }
}

/// Owned child process. Dropping an unterminated handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    grace: TerminateGrace,
    exit_status: Option<ExitStatus>,
    terminated: bool,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            grace: TerminateGrace::default(),
            exit_status: None,
            terminated: false,
        }
    }

    pub fn with_grace(mut self, grace: TerminateGrace) -> Self {
        self.grace = grace;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stop the process and reap it.
    ///
    /// Idempotent: later calls return the status observed by the first one.
    /// Returns `None` if the process could not be reaped within the grace periods.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        if self.terminated {
            return self.exit_status;
        }
        self.terminated = true;

        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(pid = ?self.pid, %status, "Module process already exited");
            self.exit_status = Some(status);
            self.sweep_group();
            return self.exit_status;
        }

        #[cfg(unix)]
        {
            if !self.grace.term.is_zero() {
                self.signal_group(nix::sys::signal::Signal::SIGTERM);
                let waited = tokio::time::timeout(self.grace.term, self.child.wait()).await;
                if let Ok(Ok(status)) = waited {
                    tracing::debug!(pid = ?self.pid, %status, "Module process exited after SIGTERM");
                    self.exit_status = Some(status);
                    self.sweep_group();
                    return self.exit_status;
                }
            }
        }

        self.force_kill();
        match tokio::time::timeout(self.grace.kill, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?self.pid, %status, "Module process killed");
                self.exit_status = Some(status);
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to reap module process");
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    grace_ms = self.grace.kill.as_millis() as u64,
                    "Module process did not exit after kill"
                );
            }
        }
        self.exit_status
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the child was already reaped.
            if e.kind() != io::ErrorKind::InvalidInput {
                tracing::debug!(pid = ?self.pid, error = %e, "start_kill failed");
            }
        }
    }

    /// Kill whatever is left in the group once the leader is gone. The group id
    /// stays reserved while any member lives, so this cannot hit a stranger.
    fn sweep_group(&self) {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
    }

    /// Signal the whole process group so helpers the module spawned go too.
    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pid, %signal, error = %e, "Failed to signal module process group"),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        match self.child.try_wait() {
            Ok(None) => {
                tracing::debug!(pid = ?self.pid, "Killing module process on drop");
                self.force_kill();
            }
            _ => self.sweep_group(),
        }
    }
}

/// A freshly started module with its three pipes.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub handle: ProcessHandle,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Extension point for different module spawn strategies.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn launch(&self, entry_point: &Path) -> Result<LaunchedProcess, LaunchError>;

    async fn terminate(&self, handle: &mut ProcessHandle) -> Option<ExitStatus> {
        handle.terminate().await
    }
}

/// Spawns `interpreter entry_point`, or the entry point itself when no
/// interpreter is configured.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    interpreter: Option<PathBuf>,
    env: Vec<(String, String)>,
    grace: TerminateGrace,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launcher for Python modules: unbuffered output so progress arrives live.
    pub fn python(interpreter: impl Into<PathBuf>) -> Self {
        Self::new()
            .with_interpreter(interpreter)
            .with_env("PYTHONUNBUFFERED", "1")
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_grace(mut self, grace: TerminateGrace) -> Self {
        self.grace = grace;
        self
    }

    pub fn interpreter(&self) -> Option<&Path> {
        self.interpreter.as_deref()
    }

    fn command(&self, entry_point: &Path) -> Command {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(entry_point);
                cmd
            }
            None => Command::new(entry_point),
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = entry_point.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, entry_point: &Path) -> Result<LaunchedProcess, LaunchError> {
        if !entry_point.is_file() {
            return Err(LaunchError::EntryPointNotFound(entry_point.to_path_buf()));
        }
        // The child runs inside the module directory, so relative paths would break.
        let entry_point = &std::path::absolute(entry_point).map_err(|source| {
            LaunchError::Spawn {
                program: entry_point.display().to_string(),
                source,
            }
        })?;

        let program = self
            .interpreter
            .as_deref()
            .unwrap_or(entry_point)
            .display()
            .to_string();
        let mut child = self
            .command(entry_point)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(LaunchError::StreamNotCaptured("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::StreamNotCaptured("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::StreamNotCaptured("stderr"))?;

        let handle = ProcessHandle::new(child).with_grace(self.grace);
        tracing::debug!(
            pid = ?handle.pid(),
            %program,
            entry_point = %entry_point.display(),
            "Launched module process"
        );
        Ok(LaunchedProcess {
            handle,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Locate a module interpreter: `CONVERSO_PYTHON` first, then the usual names on `PATH`.
pub fn discover_interpreter() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(INTERPRETER_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(explicit));
    }
    INTERPRETER_CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
}

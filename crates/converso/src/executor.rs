//! Module bridge - one request/response exchange per module process.
//!
//! Flow per call:
//! 1. Validate the request (nothing is spawned for a bad one)
//! 2. Launch the module and register the call in the live-call table
//! 3. Write the request line, close stdin
//! 4. Read stdout: progress goes to the sink, the first final response ends the call
//! 5. Terminate the process on every exit path

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::codec::{MAX_LINE_LENGTH, ModuleLineCodec};
use crate::bridge::protocol::{
    ModuleMessage, ModuleRequest, ModuleResponse, ProgressEvent, ProtocolError,
};
use crate::launcher::{LaunchError, LaunchedProcess, Launcher};

/// Target for module stderr lines.
pub const MODULE_LOG_TARGET: &str = "converso::module";

/// How long to let the stderr drain finish after the process is gone.
const STDERR_FLUSH_GRACE: Duration = Duration::from_millis(250);

/// Receiver side is owned by the caller; the bridge never blocks on it.
pub type ProgressSink = mpsc::Sender<ProgressEvent>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to launch module: {0}")]
    LaunchFailed(#[from] LaunchError),
    #[error("module timed out after {}s", .0.as_secs_f64())]
    ModuleTimeout(Duration),
    #[error("module error: {0}")]
    ModuleError(String),
    #[error("module call cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.code(),
            Self::LaunchFailed(_) => "LAUNCH_FAILED",
            Self::ModuleTimeout(_) => "MODULE_TIMEOUT",
            Self::ModuleError(_) => "MODULE_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Identifier for one in-flight module call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-call knobs. Everything is optional.
#[derive(Debug, Default)]
pub struct ExecuteOptions {
    /// Overrides the request's own timeout.
    pub deadline: Option<Duration>,
    pub progress: Option<ProgressSink>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Snapshot of a live call.
#[derive(Debug, Clone)]
pub struct LiveCallInfo {
    pub id: CallId,
    pub entry_point: PathBuf,
    pub command: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

struct LiveCall {
    entry_point: PathBuf,
    command: String,
    pid: Option<u32>,
    cancel: CancellationToken,
    started_at: Instant,
}

type CallTable = StdMutex<HashMap<CallId, LiveCall>>;

fn lock_calls(calls: &CallTable) -> std::sync::MutexGuard<'_, HashMap<CallId, LiveCall>> {
    // The table holds plain data, a panic elsewhere cannot leave it half-updated.
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a call from the table when the call scope ends, however it ends.
struct CallGuard<'a> {
    calls: &'a CallTable,
    id: CallId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        lock_calls(self.calls).remove(&self.id);
    }
}

/// Runs module commands as child processes.
pub struct ModuleBridge {
    launcher: Arc<dyn Launcher>,
    calls: CallTable,
    shutdown: CancellationToken,
}

impl ModuleBridge {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            calls: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run a command and return its final response. Progress is discarded.
    pub async fn execute(
        &self,
        entry_point: &Path,
        request: ModuleRequest,
    ) -> Result<ModuleResponse, BridgeError> {
        self.execute_with(entry_point, request, ExecuteOptions::default())
            .await
    }

    /// Run a command, offering each progress event to `sink` as it arrives.
    pub async fn execute_with_progress(
        &self,
        entry_point: &Path,
        request: ModuleRequest,
        sink: ProgressSink,
    ) -> Result<ModuleResponse, BridgeError> {
        self.execute_with(entry_point, request, ExecuteOptions::new().with_progress(sink))
            .await
    }

    pub async fn execute_with(
        &self,
        entry_point: &Path,
        request: ModuleRequest,
        options: ExecuteOptions,
    ) -> Result<ModuleResponse, BridgeError> {
        let request = request.validated()?;
        let ExecuteOptions {
            deadline,
            progress,
            cancel,
        } = options;
        let deadline = deadline.unwrap_or_else(|| request.timeout());
        let call_id = CallId::new();
        let command = request.command.clone();

        let LaunchedProcess {
            mut handle,
            stdin,
            stdout,
            stderr,
        } = self.launcher.launch(entry_point).inspect_err(|e| {
            tracing::error!(
                %call_id,
                %command,
                entry_point = %entry_point.display(),
                error = %e,
                "Failed to launch module"
            );
        })?;

        let token = self.shutdown.child_token();
        let _guard = self.register(
            call_id,
            LiveCall {
                entry_point: entry_point.to_path_buf(),
                command: command.clone(),
                pid: handle.pid(),
                cancel: token.clone(),
                started_at: Instant::now(),
            },
        );
        let mut stderr_task = tokio::spawn(drain_stderr(call_id, stderr));

        tracing::info!(
            %call_id,
            %command,
            pid = ?handle.pid(),
            timeout_secs = deadline.as_secs_f64(),
            "Executing module command"
        );
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(BridgeError::Cancelled),
            _ = cancelled(cancel.as_ref()) => Err(BridgeError::Cancelled),
            result = tokio::time::timeout(
                deadline,
                exchange(call_id, stdin, stdout, request, progress),
            ) => result.unwrap_or_else(|_| Err(BridgeError::ModuleTimeout(deadline))),
        };

        let exit_status = self.launcher.terminate(&mut handle).await;
        if tokio::time::timeout(STDERR_FLUSH_GRACE, &mut stderr_task)
            .await
            .is_err()
        {
            stderr_task.abort();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(response) => tracing::info!(
                %call_id,
                %command,
                success = response.success,
                elapsed_ms,
                exit_status = ?exit_status,
                "Module command finished"
            ),
            Err(e) => tracing::warn!(
                %call_id,
                %command,
                code = e.code(),
                error = %e,
                elapsed_ms,
                exit_status = ?exit_status,
                "Module command failed"
            ),
        }
        outcome
    }

    /// Cancel one live call. Returns false if the call is not running.
    pub fn cancel(&self, id: CallId) -> bool {
        match lock_calls(&self.calls).get(&id) {
            Some(call) => {
                call.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live call. Calls started afterwards are cancelled immediately.
    pub fn shutdown(&self) {
        tracing::info!(live_calls = self.live_call_count(), "Shutting down module bridge");
        self.shutdown.cancel();
    }

    pub fn live_call_count(&self) -> usize {
        lock_calls(&self.calls).len()
    }

    pub fn live_calls(&self) -> Vec<LiveCallInfo> {
        lock_calls(&self.calls)
            .iter()
            .map(|(id, call)| LiveCallInfo {
                id: *id,
                entry_point: call.entry_point.clone(),
                command: call.command.clone(),
                pid: call.pid,
                elapsed: call.started_at.elapsed(),
            })
            .collect()
    }

    fn register(&self, id: CallId, call: LiveCall) -> CallGuard<'_> {
        lock_calls(&self.calls).insert(id, call);
        CallGuard {
            calls: &self.calls,
            id,
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Write the request, then read until a final response or EOF.
async fn exchange(
    call_id: CallId,
    stdin: ChildStdin,
    stdout: ChildStdout,
    request: ModuleRequest,
    progress: Option<ProgressSink>,
) -> Result<ModuleResponse, BridgeError> {
    let mut writer = FramedWrite::new(stdin, ModuleLineCodec::new());
    if let Err(e) = writer.send(request).await {
        // The module may still have answered; keep reading.
        tracing::warn!(%call_id, error = %e, "Module closed stdin before reading the request");
    }
    // Closing stdin marks the end of the request.
    drop(writer);

    let mut relay = ProgressRelay::new(call_id, progress);
    let mut reader = FramedRead::new(stdout, ModuleLineCodec::new());
    while let Some(item) = reader.next().await {
        match item {
            Ok(Ok(ModuleMessage::Progress(mut event))) => {
                event.timestamp = Some(Utc::now());
                relay.offer(event);
            }
            Ok(Ok(ModuleMessage::Response(response))) => return Ok(response),
            Ok(Err(ProtocolError::InvalidResponse(reason))) => {
                return Err(BridgeError::ModuleError(format!(
                    "invalid final response: {reason}"
                )));
            }
            Ok(Err(e)) => {
                tracing::warn!(%call_id, error = %e, "Skipping unrecognized module output");
            }
            Err(e) => {
                return Err(BridgeError::ModuleError(format!(
                    "failed to read module output: {e}"
                )));
            }
        }
    }
    Err(BridgeError::ModuleError(
        "process ended unexpectedly".to_string(),
    ))
}

/// Non-blocking hand-off of progress events to the caller's sink.
struct ProgressRelay {
    call_id: CallId,
    sink: Option<ProgressSink>,
    delivered: u64,
    dropped: u64,
}

impl ProgressRelay {
    fn new(call_id: CallId, sink: Option<ProgressSink>) -> Self {
        Self {
            call_id,
            sink,
            delivered: 0,
            dropped: 0,
        }
    }

    fn offer(&mut self, event: ProgressEvent) {
        let Some(sink) = &self.sink else { return };
        match sink.try_send(event) {
            Ok(()) => self.delivered += 1,
            Err(TrySendError::Full(event)) => {
                self.dropped += 1;
                tracing::debug!(
                    call_id = %self.call_id,
                    stage = %event.stage,
                    "Progress sink full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(call_id = %self.call_id, "Progress sink closed, stopping delivery");
                self.sink = None;
            }
        }
    }
}

impl Drop for ProgressRelay {
    fn drop(&mut self) {
        if self.dropped > 0 {
            tracing::warn!(
                call_id = %self.call_id,
                delivered = self.delivered,
                dropped = self.dropped,
                "Progress consumer fell behind, events were dropped"
            );
        }
    }
}

async fn drain_stderr(call_id: CallId, stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: MODULE_LOG_TARGET, %call_id, "{}", line);
                }
            }
            Err(e) => {
                tracing::debug!(%call_id, error = %e, "Module stderr line skipped");
            }
        }
    }
}

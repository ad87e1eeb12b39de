use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cligate_observability::{emit_event, redact_text, ObservabilityEvent};
use cligate_types::{parse_line, CliEvent};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::queue::{event_channel, EventSender, EventStream, ExitOutcome, PollPolicy};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Completed,
    Failed { code: Option<i32> },
    Stopped,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed { .. } | ProcessState::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Completed => "completed",
            ProcessState::Failed { .. } => "failed",
            ProcessState::Stopped => "stopped",
        }
    }
}

impl From<ExitOutcome> for ProcessState {
    fn from(outcome: ExitOutcome) -> Self {
        match outcome {
            ExitOutcome::Completed => ProcessState::Completed,
            ExitOutcome::Failed { code } => ProcessState::Failed { code },
            ExitOutcome::Stopped => ProcessState::Stopped,
        }
    }
}

/// Everything needed to build one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub include_partial_messages: bool,
    pub extra_args: Vec<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SpawnSpec {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.prompt.clone()];
        match non_empty(&self.resume_session_id) {
            Some(resume) => {
                args.push("--resume".to_string());
                args.push(resume.to_string());
            }
            None => {
                // a resumed conversation already carries its system prompt
                if let Some(system_prompt) = non_empty(&self.system_prompt) {
                    args.push("--append-system-prompt".to_string());
                    args.push(system_prompt.to_string());
                }
            }
        }
        if let Some(model) = non_empty(&self.model) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.extend(
            [
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .map(String::from),
        );
        if self.include_partial_messages {
            args.push("--include-partial-messages".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    pub poll: PollPolicy,
    pub stop_grace: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub handle_id: String,
    pub session_id: String,
    pub pid: Option<u32>,
    pub model: Option<String>,
    pub working_dir: String,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ProcessState,
}

/// One running CLI invocation.
///
/// stdout lines are parsed into [`CliEvent`]s and queued in arrival order;
/// stderr lines go to a separate diagnostics queue. A supervisor task owns
/// the child and publishes the terminal state only after both readers have
/// drained, so the close marker is always the last queued item.
pub struct ProcessHandle {
    id: String,
    initial_session_id: String,
    adopted_session_id: Arc<OnceLock<String>>,
    working_dir: PathBuf,
    model: Option<String>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stop_grace: Duration,
    state: watch::Receiver<ProcessState>,
    stop: CancellationToken,
    output: Mutex<Option<EventStream>>,
    diagnostics: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ProcessHandle {
    pub fn spawn(
        session_id: impl Into<String>,
        spec: SpawnSpec,
        options: ProcessOptions,
    ) -> Result<Arc<Self>> {
        let session_id = session_id.into();
        let handle_id = Uuid::new_v4().to_string();
        let binary = spec.binary.display().to_string();
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);

        tracing::debug!(
            handle_id = %handle_id,
            session_id = %session_id,
            binary = %binary,
            prompt = %redact_text(&spec.prompt),
            resume = spec.resume_session_id.is_some(),
            "spawning cli process"
        );

        let mut command = Command::new(&spec.binary);
        command
            .args(spec.args())
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| RuntimeError::Startup {
            binary: binary.clone(),
            reason: err.to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| RuntimeError::Startup {
            binary: binary.clone(),
            reason: "stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| RuntimeError::Startup {
            binary: binary.clone(),
            reason: "stderr unavailable".to_string(),
        })?;
        let pid = child.id();

        let (events_tx, events_rx) = event_channel(options.poll);
        let (diag_tx, diag_rx) = mpsc::unbounded_channel();
        let adopted_session_id = Arc::new(OnceLock::new());

        let stdout_task = tokio::spawn(read_stdout(
            stdout,
            events_tx.clone(),
            adopted_session_id.clone(),
            handle_id.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr(stderr, diag_tx.clone(), handle_id.clone()));

        let stop = CancellationToken::new();
        let _ = state_tx.send(ProcessState::Running);
        tokio::spawn(supervise(Supervision {
            child,
            handle_id: handle_id.clone(),
            stop: stop.clone(),
            stop_grace: options.stop_grace,
            stdout_task,
            stderr_task,
            events: events_tx,
            diagnostics: diag_tx,
            state: state_tx,
        }));

        let pid_text = pid.map(|p| format!("pid={p}"));
        emit_event(
            tracing::Level::INFO,
            ObservabilityEvent {
                session_id: Some(&session_id),
                handle_id: Some(&handle_id),
                model_id: spec.model.as_deref(),
                status: Some("running"),
                detail: pid_text.as_deref(),
                ..ObservabilityEvent::new("process.spawned", "runtime.process")
            },
        );

        Ok(Arc::new(Self {
            id: handle_id,
            initial_session_id: session_id,
            adopted_session_id,
            working_dir: spec.working_dir,
            model: spec.model,
            pid,
            started_at: Utc::now(),
            stop_grace: options.stop_grace,
            state: state_rx,
            stop,
            output: Mutex::new(Some(events_rx)),
            diagnostics: Mutex::new(diag_rx),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The id the CLI reported for this conversation, or the id the handle
    /// was created with until it does.
    pub fn session_id(&self) -> String {
        self.adopted_session_id
            .get()
            .cloned()
            .unwrap_or_else(|| self.initial_session_id.clone())
    }

    pub fn initial_session_id(&self) -> &str {
        &self.initial_session_id
    }

    pub fn cli_session_id(&self) -> Option<&str> {
        self.adopted_session_id.get().map(String::as_str)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal()
    }

    /// Takes the event sequence. It can only be taken once.
    pub fn take_output(&self) -> Result<EventStream> {
        let mut slot = match self.output.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
            .ok_or_else(|| RuntimeError::OutputTaken(self.id.clone()))
    }

    /// Stderr lines (and the failure summary, if any) seen so far.
    pub fn drain_diagnostics(&self) -> Vec<String> {
        let mut rx = match self.diagnostics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    pub async fn wait(&self) -> ProcessState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// SIGTERM, then SIGKILL after the grace period. No-op once terminal.
    pub async fn stop(&self) -> ProcessState {
        if self.is_terminal() {
            return self.state();
        }
        self.stop.cancel();
        let budget = self.stop_grace * 3 + Duration::from_secs(1);
        match tokio::time::timeout(budget, self.wait()).await {
            Ok(state) => state,
            Err(_) => {
                tracing::warn!(handle_id = %self.id, "process did not reach a terminal state after stop");
                self.state()
            }
        }
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            handle_id: self.id.clone(),
            session_id: self.session_id(),
            pid: self.pid,
            model: self.model.clone(),
            working_dir: self.working_dir.display().to_string(),
            started_at: self.started_at,
            state: self.state(),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Supervision {
    child: Child,
    handle_id: String,
    stop: CancellationToken,
    stop_grace: Duration,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    events: EventSender,
    diagnostics: mpsc::UnboundedSender<String>,
    state: watch::Sender<ProcessState>,
}

async fn supervise(mut sup: Supervision) {
    let outcome = tokio::select! {
        status = sup.child.wait() => match status {
            Ok(status) if status.success() => ExitOutcome::Completed,
            Ok(status) => ExitOutcome::Failed { code: status.code() },
            Err(err) => {
                tracing::warn!(handle_id = %sup.handle_id, "waiting on cli process failed: {}", err);
                ExitOutcome::Failed { code: None }
            }
        },
        _ = sup.stop.cancelled() => {
            terminate(&mut sup.child, sup.stop_grace).await;
            ExitOutcome::Stopped
        }
    };

    join_reader(&mut sup.stdout_task, sup.stop_grace, "stdout").await;
    join_reader(&mut sup.stderr_task, sup.stop_grace, "stderr").await;

    if let ExitOutcome::Failed { code } = outcome {
        let message = match code {
            Some(code) => format!("Process failed with exit code {code}"),
            None => "Process terminated by signal".to_string(),
        };
        tracing::error!(handle_id = %sup.handle_id, "{}", message);
        let _ = sup.diagnostics.send(message.clone());
        sup.events
            .send(CliEvent::error(message, Some("process_failure")));
    }

    let state = ProcessState::from(outcome);
    sup.state.send_replace(state);
    sup.events.close(outcome);

    emit_event(
        if matches!(outcome, ExitOutcome::Failed { .. }) {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        },
        ObservabilityEvent {
            handle_id: Some(&sup.handle_id),
            status: Some(state.as_str()),
            ..ObservabilityEvent::new("process.exited", "runtime.process")
        },
    );
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if send_sigterm(child) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    if let Err(err) = child.kill().await {
        tracing::warn!("failed to kill cli process: {}", err);
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: pid names our own child, which has not been reaped yet.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

async fn join_reader(task: &mut JoinHandle<()>, grace: Duration, stream: &str) {
    if tokio::time::timeout(grace, &mut *task).await.is_err() {
        tracing::warn!(stream, "reader did not drain after exit; aborting");
        task.abort();
    }
}

async fn read_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    events: EventSender,
    adopted_session_id: Arc<OnceLock<String>>,
    handle_id: String,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let line = raw.trim();
                if line.is_empty() {
                    continue;
                }
                let parsed = parse_line(line);
                if let Some(session_id) = parsed.session_id {
                    if adopted_session_id.set(session_id.clone()).is_ok() {
                        tracing::info!(handle_id = %handle_id, session_id = %session_id, "adopted cli session id");
                    }
                }
                events.send(parsed.event);
            }
            Err(err) => {
                tracing::warn!(handle_id = %handle_id, "stdout read failed: {}", err);
                events.send(CliEvent::error(
                    format!("Failed to read process output: {err}"),
                    Some("read_error"),
                ));
                break;
            }
        }
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    diagnostics: mpsc::UnboundedSender<String>,
    handle_id: String,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let line = raw.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::warn!(handle_id = %handle_id, "cli stderr: {}", line);
                let _ = diagnostics.send(line.to_string());
            }
        }
    }
}

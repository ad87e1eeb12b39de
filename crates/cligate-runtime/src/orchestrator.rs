use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cligate_observability::{emit_event, ObservabilityEvent};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{Result, RuntimeError};
use crate::process::{ProcessHandle, ProcessInfo, ProcessOptions, ProcessState, SpawnSpec};

pub const DEFAULT_MAX_CONCURRENT: usize = 10;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub binary: PathBuf,
    pub max_concurrent: usize,
    pub include_partial_messages: bool,
    pub extra_args: Vec<String>,
    pub process: ProcessOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            include_partial_messages: true,
            extra_args: Vec::new(),
            process: ProcessOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub session_id: String,
    pub project_path: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    pub env: HashMap<String, String>,
}

/// Tracks in-flight CLI processes by session id.
///
/// A single lock guards the map so that the busy check, the capacity check
/// and the insert of a new handle happen as one step.
#[derive(Clone)]
pub struct ProcessOrchestrator {
    config: Arc<OrchestratorConfig>,
    handles: Arc<Mutex<HashMap<String, Arc<ProcessHandle>>>>,
}

impl ProcessOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config: Arc::new(config),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn create_or_resume(&self, request: LaunchRequest) -> Result<Arc<ProcessHandle>> {
        let key = request.session_id.clone();
        let resume = request
            .resume_session_id
            .clone()
            .filter(|id| !id.trim().is_empty());
        let initial_id = resume.clone().unwrap_or_else(|| key.clone());

        let mut handles = self.handles.lock().await;
        let busy = handles.iter().any(|(tracked_key, handle)| {
            if handle.is_terminal() {
                return false;
            }
            let effective = handle.session_id();
            tracked_key == &key || effective == key || effective == initial_id
        });
        if busy {
            return Err(RuntimeError::Conflict(key));
        }
        if handles.get(&key).is_some_and(|h| h.is_terminal()) {
            handles.remove(&key);
        }

        let active = handles.values().filter(|h| !h.is_terminal()).count();
        if active >= self.config.max_concurrent {
            emit_event(
                tracing::Level::WARN,
                ObservabilityEvent {
                    session_id: Some(&key),
                    status: Some("rejected"),
                    error_code: Some("capacity_exceeded"),
                    ..ObservabilityEvent::new("process.capacity", "runtime.orchestrator")
                },
            );
            return Err(RuntimeError::Capacity {
                limit: self.config.max_concurrent,
            });
        }

        let spec = SpawnSpec {
            binary: self.config.binary.clone(),
            prompt: request.prompt,
            model: request.model,
            system_prompt: request.system_prompt,
            resume_session_id: resume,
            working_dir: request.project_path,
            env: request.env,
            include_partial_messages: self.config.include_partial_messages,
            extra_args: self.config.extra_args.clone(),
        };
        let handle = ProcessHandle::spawn(initial_id, spec, self.config.process)?;
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    /// Finds a tracked handle by its key or by the id the CLI reported.
    pub async fn lookup(&self, session_id: &str) -> Option<Arc<ProcessHandle>> {
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(session_id) {
            return Some(handle.clone());
        }
        handles
            .values()
            .find(|h| h.session_id() == session_id)
            .cloned()
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.lookup(session_id)
            .await
            .is_some_and(|h| h.is_running())
    }

    /// Stops and untracks the handle for `session_id`. Returns false when
    /// nothing was tracked.
    pub async fn stop(&self, session_id: &str) -> bool {
        let handle = {
            let mut handles = self.handles.lock().await;
            let key = if handles.contains_key(session_id) {
                Some(session_id.to_string())
            } else {
                handles
                    .iter()
                    .find(|(_, h)| h.session_id() == session_id)
                    .map(|(k, _)| k.clone())
            };
            key.and_then(|k| handles.remove(&k))
        };
        let Some(handle) = handle else {
            return false;
        };
        let state = handle.stop().await;
        tracing::info!(session_id, state = state.as_str(), "stopped cli process");
        true
    }

    /// Releases a handle at the end of the request that created it. Only the
    /// entry holding this exact handle is untracked.
    pub async fn finish(&self, handle: &ProcessHandle) -> ProcessState {
        let state = handle.stop().await;
        let mut handles = self.handles.lock().await;
        handles.retain(|_, tracked| tracked.id() != handle.id());
        state
    }

    /// Ties `handle` to the lifetime of the returned lease.
    pub fn lease(&self, handle: Arc<ProcessHandle>) -> ProcessLease {
        ProcessLease {
            orchestrator: self.clone(),
            handle,
            released: false,
        }
    }

    /// Untracks handles whose process has already exited.
    pub async fn reap_zombies(&self) -> usize {
        let reaped = {
            let mut handles = self.handles.lock().await;
            let keys = handles
                .iter()
                .filter(|(_, h)| h.is_terminal())
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|k| handles.remove(&k).map(|h| (k, h)))
                .collect::<Vec<_>>()
        };
        for (key, handle) in &reaped {
            tracing::info!(
                session_id = %key,
                handle_id = handle.id(),
                state = handle.state().as_str(),
                "reaped exited cli process"
            );
        }
        reaped.len()
    }

    /// Stops every tracked handle concurrently. Handles still alive when
    /// `timeout` elapses are abandoned.
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        let handles = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, h)| h).collect::<Vec<_>>()
        };
        if handles.is_empty() {
            return 0;
        }
        tracing::info!(count = handles.len(), "stopping all cli processes");
        let stops = futures::future::join_all(handles.iter().map(|h| h.stop()));
        match tokio::time::timeout(timeout, stops).await {
            Ok(states) => states.len(),
            Err(_) => {
                let stragglers = handles.iter().filter(|h| h.is_running()).count();
                tracing::warn!(stragglers, "shutdown timed out with processes still running");
                handles.len() - stragglers
            }
        }
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let handles = self.handles.lock().await;
        let mut ids = handles
            .values()
            .filter(|h| h.is_running())
            .map(|h| h.session_id())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn tracked_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn processes(&self) -> Vec<ProcessInfo> {
        let handles = self.handles.lock().await;
        handles.values().map(|h| h.info()).collect()
    }

    /// `<binary> --version`, trimmed.
    pub async fn version(&self) -> anyhow::Result<String> {
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(&self.config.binary)
                .arg("--version")
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .context("timed out waiting for --version")?
        .with_context(|| format!("failed to run {}", self.config.binary.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} --version exited with {}",
                self.config.binary.display(),
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Request-scoped claim on a tracked handle. A lease dropped before
/// [`ProcessLease::release`] completes spawns `finish` on the current runtime,
/// so an abandoned request still frees its process and its session slot.
pub struct ProcessLease {
    orchestrator: ProcessOrchestrator,
    handle: Arc<ProcessHandle>,
    released: bool,
}

impl ProcessLease {
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub async fn release(mut self) -> ProcessState {
        let state = self.orchestrator.finish(&self.handle).await;
        self.released = true;
        state
    }
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(handle_id = self.handle.id(), "lease dropped outside a runtime");
            return;
        };
        let orchestrator = self.orchestrator.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            let state = orchestrator.finish(&handle).await;
            tracing::info!(
                handle_id = handle.id(),
                session_id = %handle.session_id(),
                state = state.as_str(),
                "released abandoned cli process"
            );
        });
    }
}

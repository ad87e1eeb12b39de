use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderValue};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cligate_core::{
    aggregate, delay_from_secs, AggregateOptions, ConversionOptions, GatewayError,
    InclusionPolicy, SessionStore, StreamConverter,
};
use cligate_observability::{emit_event, redact_text, ObservabilityEvent};
use cligate_runtime::{LaunchRequest, ProcessHandle, ProcessLease};
use cligate_types::{SessionInfo, SessionUpdate};
use cligate_wire::{ChatCompletionRequest, WireModel, WireModelList, WireSessionStatus};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Base timestamp for the `created` field of listed models.
const MODELS_CREATED_BASE: i64 = 1_704_067_200;
const MAX_DIAGNOSTIC_LINES: usize = 5;

/// Error response in the OpenAI shape.
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(GatewayError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), "request failed: {:#}", self.0);
        } else {
            tracing::debug!(code = self.0.code(), "request rejected: {}", self.0);
        }
        (status, Json(self.0.to_wire())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let maintenance_state = state.clone();
    let shutdown_state = state.clone();
    let interval = state.config.reaper_interval();
    let app = app_router(state);
    let maintenance = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            run_maintenance(&maintenance_state).await;
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "cligate listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
            // open SSE responses hold the server open until their streams end
            let stopped = shutdown_state
                .orchestrator
                .shutdown_all(shutdown_state.config.shutdown_timeout())
                .await;
            let cancelled = shutdown_state.streams.cleanup_all();
            tracing::info!(stopped, cancelled, "released cli processes and streams");
        })
        .await;
    maintenance.abort();
    result?;
    Ok(())
}

/// One pass of background upkeep: reclaim exited processes and expire idle
/// sessions. Returns `(reaped, expired)`.
pub async fn run_maintenance(state: &AppState) -> (usize, usize) {
    let reaped = state.orchestrator.reap_zombies().await;
    let expired = match state
        .sessions
        .cleanup_expired(state.config.session_timeout())
        .await
    {
        Ok(ids) => ids.len(),
        Err(err) => {
            tracing::warn!("session cleanup failed: {err:#}");
            0
        }
    };
    if reaped > 0 || expired > 0 {
        tracing::info!(reaped, expired, "maintenance pass");
    }
    (reaped, expired)
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route(
            "/v1/chat/completions/{session_id}",
            axum::routing::delete(delete_session),
        )
        .route(
            "/v1/chat/completions/{session_id}/status",
            get(session_status),
        )
        .route("/v1/models", get(list_models))
        .route("/v1/models/{*model_id}", get(get_model))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/{session_id}", get(get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "cligate",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "OpenAI-compatible chat completions backed by a coding CLI",
        "endpoints": {
            "chat_completions": "/v1/chat/completions",
            "session_status": "/v1/chat/completions/{session_id}/status",
            "stop_session": "/v1/chat/completions/{session_id}",
            "models": "/v1/models",
            "sessions": "/v1/sessions",
            "health": "/health",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    let zombies_reaped = state.orchestrator.reap_zombies().await;
    let version = state.orchestrator.version().await;
    let healthy = version.is_ok();
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "claude_version": version.as_ref().ok(),
        "error": version.as_ref().err().map(|e| format!("{e:#}")),
        "active_sessions": state.orchestrator.active_sessions().await,
        "tracked_processes": state.orchestrator.tracked_count().await,
        "processes": state.orchestrator.processes().await,
        "active_streams": state.streams.active_count(),
        "streams": state.streams.active(),
        "zombies_reaped": zombies_reaped,
        "uptime_secs": state.uptime_secs(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Sessions and launch parameters resolved for one chat request.
struct PreparedRun {
    session_id: String,
    project_id: String,
    model: String,
    prompt: String,
}

fn default_project_id(user: Option<&str>) -> String {
    let user = user.map(str::trim).filter(|u| !u.is_empty()).unwrap_or("anon");
    format!("default-{user}")
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = payload.map_err(|rejection| {
        GatewayError::invalid_request("invalid_json", rejection.body_text())
    })?;
    if req.messages.is_empty() {
        return Err(
            GatewayError::invalid_request("missing_messages", "messages must not be empty").into(),
        );
    }
    let prompt = req
        .last_user_prompt()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            GatewayError::invalid_request("missing_user_message", "No user message found in request")
        })?;
    let model = non_empty(req.provider_model.as_ref())
        .or_else(|| non_empty(req.model.as_ref()))
        .unwrap_or_else(|| state.config.default_model.clone());
    if !state.providers.is_supported(&model) {
        tracing::debug!(model = %model, "model not in provider table; using default endpoint");
    }
    let system_prompt = req.effective_system_prompt();

    let (session_id, project_id, resume_session_id, fresh) = match non_empty(req.session_id.as_ref()) {
        Some(session_id) => {
            if state.orchestrator.is_running(&session_id).await {
                return Err(GatewayError::Conflict(session_id).into());
            }
            let existing = state.sessions.get(&session_id).await?;
            let project_id = non_empty(req.project_id.as_ref())
                .or_else(|| existing.as_ref().map(|s| s.project_id.clone()))
                .unwrap_or_else(|| default_project_id(req.user.as_deref()));
            let (resume, fresh) = match existing {
                Some(info) => (
                    info.cli_session_id
                        .is_some()
                        .then(|| info.resume_target().to_string()),
                    false,
                ),
                None => {
                    // an id we never issued is taken to be a CLI session id
                    let mut info = SessionInfo::with_id(&session_id, &project_id, &model);
                    info.system_prompt = system_prompt.clone();
                    info.cli_session_id = Some(session_id.clone());
                    state.sessions.register(info).await?;
                    (Some(session_id.clone()), true)
                }
            };
            (session_id, project_id, resume, fresh)
        }
        None => {
            let project_id = non_empty(req.project_id.as_ref())
                .unwrap_or_else(|| default_project_id(req.user.as_deref()));
            let session_id = state
                .sessions
                .create(&project_id, &model, system_prompt.as_deref())
                .await?;
            (session_id, project_id, None, true)
        }
    };

    let env = state.providers.resolve_env(
        &model,
        req.provider_base_url.as_deref(),
        req.provider_api_key.as_deref(),
    );

    tracing::info!(
        session_id = %session_id,
        project_id = %project_id,
        model = %model,
        stream = req.stream,
        resume = resume_session_id.is_some(),
        prompt = %redact_text(&prompt),
        "chat completion request"
    );

    let launched = match state.projects.ensure_directory(&project_id).await {
        Ok(project_path) => state
            .orchestrator
            .create_or_resume(LaunchRequest {
                session_id: session_id.clone(),
                project_path,
                prompt: prompt.clone(),
                model: Some(model.clone()),
                system_prompt,
                resume_session_id,
                env,
            })
            .await
            .map_err(GatewayError::from),
        Err(err) => Err(GatewayError::from(err)),
    };
    // sessions made for this request are forgotten if their first turn never starts
    let handle = match launched {
        Ok(handle) => handle,
        Err(err) => {
            // a conflicting request does not own the session it found
            if fresh && !matches!(err, GatewayError::Conflict(_)) {
                if let Err(remove_err) = state.sessions.remove(&session_id).await {
                    tracing::warn!(session_id = %session_id, "failed to drop unstarted session: {remove_err:#}");
                }
            }
            return Err(err.into());
        }
    };
    let lease = state.orchestrator.lease(handle.clone());
    state
        .sessions
        .update(
            &session_id,
            SessionUpdate {
                message_content: Some(prompt.clone()),
                role: Some("user".to_string()),
                tokens_used: word_count(&prompt),
                ..Default::default()
            },
        )
        .await?;
    emit_event(
        tracing::Level::INFO,
        ObservabilityEvent {
            session_id: Some(&session_id),
            handle_id: Some(handle.id()),
            model_id: Some(&model),
            ..ObservabilityEvent::new("chat.started", "http")
        },
    );

    let inclusion = InclusionPolicy::from_flags(
        req.include_thoughts,
        req.include_tool_calls,
        req.include_metadata,
    );
    let run = PreparedRun {
        session_id,
        project_id,
        model,
        prompt,
    };
    if req.stream {
        let options = ConversionOptions {
            model: run.model.clone(),
            mode: req.streaming_mode.unwrap_or_default(),
            delay: delay_from_secs(req.streaming_delay, state.config.default_streaming_delay()),
            inclusion,
        };
        stream_response(state, lease, run, options)
    } else {
        let options = AggregateOptions {
            model: run.model.clone(),
            inclusion,
            max_events: state.config.max_collected_events.max(1),
        };
        complete_response(state, lease, run, options).await
    }
}

fn with_session_headers(mut response: Response, session_id: &str, project_id: &str) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(session_id) {
        headers.insert("x-session-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(project_id) {
        headers.insert("x-project-id", value);
    }
    response
}

/// Saves the CLI-reported id so the next request can `--resume` it.
async fn record_cli_session(sessions: &dyn SessionStore, session_id: &str, handle: &ProcessHandle) {
    let Some(cli_session_id) = handle.cli_session_id() else {
        return;
    };
    let update = SessionUpdate {
        cli_session_id: Some(cli_session_id.to_string()),
        ..Default::default()
    };
    if let Err(err) = sessions.update(session_id, update).await {
        tracing::warn!(session_id, "failed to record cli session id: {err:#}");
    }
}

fn stream_response(
    state: AppState,
    lease: ProcessLease,
    run: PreparedRun,
    options: ConversionOptions,
) -> ApiResult<Response> {
    let events = lease.handle().take_output().map_err(GatewayError::from)?;
    let sessions = state.sessions.clone();
    let release_session_id = run.session_id.clone();
    let guard = state
        .streams
        .register(&run.session_id, &run.model)
        .on_release(move || {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            runtime.spawn(async move {
                let handle = lease.handle().clone();
                let final_state = lease.release().await;
                record_cli_session(sessions.as_ref(), &release_session_id, &handle).await;
                tracing::info!(
                    session_id = %release_session_id,
                    state = final_state.as_str(),
                    "stream finished"
                );
            });
        });

    let frames = StreamConverter::new(options).into_frames(events, Some(guard));
    let body = frames.filter_map(|frame| match frame.data() {
        Ok(data) => Some(Ok::<_, Infallible>(Event::default().data(data))),
        Err(err) => {
            tracing::warn!("dropping unserializable frame: {err}");
            None
        }
    });
    let keep_alive = KeepAlive::new()
        .interval(state.config.heartbeat_interval())
        .text("heartbeat");
    let mut response = Sse::new(body).keep_alive(keep_alive).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(with_session_headers(response, &run.session_id, &run.project_id))
}

async fn complete_response(
    state: AppState,
    lease: ProcessLease,
    run: PreparedRun,
    options: AggregateOptions,
) -> ApiResult<Response> {
    let handle = lease.handle().clone();
    let events = match handle.take_output() {
        Ok(events) => events,
        Err(err) => {
            lease.release().await;
            return Err(GatewayError::from(err).into());
        }
    };
    // a dropped request drops the lease, which releases the process
    let outcome = aggregate(events, &run.prompt, &options).await;
    let final_state = lease.release().await;
    record_cli_session(state.sessions.as_ref(), &run.session_id, &handle).await;
    tracing::debug!(session_id = %run.session_id, state = final_state.as_str(), "cli process released");

    let mut aggregated = match outcome {
        Ok(aggregated) => aggregated,
        Err(GatewayError::ProcessFailure { code, .. }) => {
            let diagnostics = handle.drain_diagnostics();
            let start = diagnostics.len().saturating_sub(MAX_DIAGNOSTIC_LINES);
            let detail = (!diagnostics.is_empty()).then(|| diagnostics[start..].join("; "));
            return Err(GatewayError::ProcessFailure { code, detail }.into());
        }
        Err(err) => return Err(err.into()),
    };

    let content = aggregated.completion.content().to_string();
    let update = SessionUpdate {
        message_content: Some(content),
        role: Some("assistant".to_string()),
        tokens_used: aggregated.completion.usage.completion_tokens,
        cost: aggregated
            .summary
            .as_ref()
            .and_then(|s| s.cost_usd)
            .unwrap_or(0.0),
        ..Default::default()
    };
    state.sessions.update(&run.session_id, update).await?;

    aggregated.completion.session_id = Some(run.session_id.clone());
    aggregated.completion.project_id = Some(run.project_id.clone());
    let response = Json(aggregated.completion).into_response();
    Ok(with_session_headers(response, &run.session_id, &run.project_id))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<WireSessionStatus>> {
    let info = state.sessions.get(&session_id).await?;
    let is_running = state.orchestrator.is_running(&session_id).await;
    if info.is_none() && !is_running {
        return Err(GatewayError::NotFound(session_id).into());
    }
    Ok(Json(WireSessionStatus::from_session(
        info.as_ref(),
        &session_id,
        is_running,
    )))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let stopped = state.orchestrator.stop(&session_id).await;
    let cancelled_streams = state.streams.cancel_session(&session_id);
    let ended = state.sessions.end(&session_id).await?;
    if !stopped && !ended {
        return Err(GatewayError::NotFound(session_id).into());
    }
    tracing::info!(session_id = %session_id, stopped, ended, "session stopped");
    Ok(Json(json!({
        "session_id": session_id,
        "status": "stopped",
        "process_stopped": stopped,
        "streams_cancelled": cancelled_streams,
        "session_ended": ended,
    })))
}

async fn owned_by(state: &AppState) -> String {
    match state.orchestrator.version().await {
        Ok(version) => match version.split_whitespace().next() {
            Some(v) => format!("anthropic-claude-{v}"),
            None => "anthropic".to_string(),
        },
        Err(err) => {
            tracing::debug!("cli version unavailable: {err:#}");
            "anthropic".to_string()
        }
    }
}

async fn list_models(State(state): State<AppState>) -> Json<WireModelList> {
    let owned_by = owned_by(&state).await;
    let data = state
        .providers
        .supported_models()
        .into_iter()
        .enumerate()
        .map(|(idx, id)| WireModel {
            id,
            object: "model".to_string(),
            created: MODELS_CREATED_BASE + idx as i64,
            owned_by: owned_by.clone(),
        })
        .collect();
    Json(WireModelList {
        object: "list".to_string(),
        data,
    })
}

async fn get_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<WireModel>> {
    let models = state.providers.supported_models();
    let Some(idx) = models.iter().position(|m| m == &model_id) else {
        return Err(GatewayError::ModelNotFound(model_id).into());
    };
    Ok(Json(WireModel {
        id: model_id,
        object: "model".to_string(),
        created: MODELS_CREATED_BASE + idx as i64,
        owned_by: owned_by(&state).await,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.sessions.list().await?;
    let running = state.orchestrator.active_sessions().await;
    let data = sessions
        .into_iter()
        .map(|info| {
            let is_running = running.contains(&info.session_id)
                || info
                    .cli_session_id
                    .as_ref()
                    .is_some_and(|id| running.contains(id));
            let mut value = cligate_wire::value_of(&info);
            value["is_running"] = json!(is_running);
            value
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "object": "list", "data": data })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let Some(info) = state.sessions.get(&session_id).await? else {
        return Err(GatewayError::NotFound(session_id).into());
    };
    let is_running = state.orchestrator.is_running(&info.session_id).await;
    let mut value = cligate_wire::value_of(&info);
    value["is_running"] = json!(is_running);
    Ok(Json(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use cligate_core::GatewayConfig;
    use std::path::{Path as FsPath, PathBuf};
    use std::time::Duration;
    use tower::ServiceExt;

    const HAPPY_CLI: &str = r#"
if [ "$1" = "--version" ]; then echo "1.0.42 (Claude Code)"; exit 0; fi
echo '{"type":"system","subtype":"init","session_id":"cli-123"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]},"session_id":"cli-123"}'
echo '{"type":"result","is_error":false,"result":"Hi","total_cost_usd":0.01,"session_id":"cli-123"}'
"#;

    #[cfg(unix)]
    fn fake_cli(dir: &FsPath, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(format!("fake-cli-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn test_config(dir: &FsPath, binary: PathBuf) -> GatewayConfig {
        GatewayConfig {
            binary_path: binary,
            project_root: dir.join("projects"),
            output_poll_timeout_ms: 500,
            max_output_timeouts: 3,
            stop_grace_ms: 300,
            default_streaming_delay_ms: 0,
            ..Default::default()
        }
    }

    fn test_state(dir: &FsPath, binary: PathBuf) -> AppState {
        AppState::new(test_config(dir, binary))
    }

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn json_body(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    #[tokio::test]
    async fn missing_user_message_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path(), PathBuf::from("claude")));
        let resp = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "system", "content": "be nice"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let payload = json_body(resp).await;
        assert_eq!(payload["error"]["code"], "missing_user_message");
        assert_eq!(payload["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path(), PathBuf::from("claude")));
        let resp = app
            .oneshot(chat_request(json!({ "messages": [] })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"]["code"], "missing_messages");
    }

    #[tokio::test]
    async fn missing_binary_is_service_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), dir.path().join("no-such-cli"));
        let app = app_router(state.clone());
        let resp = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["error"]["code"], "claude_unavailable");
        assert_eq!(state.orchestrator.tracked_count().await, 0);
        assert!(state.sessions.list().await.expect("list").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_streaming_completion_returns_content_and_records_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), fake_cli(dir.path(), HAPPY_CLI));
        let app = app_router(state.clone());
        let resp = app
            .oneshot(chat_request(json!({
                "model": "claude-sonnet-4-20250514",
                "messages": [{"role": "user", "content": "say hi"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let session_id = resp
            .headers()
            .get("x-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .expect("session header");
        assert_eq!(
            resp.headers().get("x-project-id").and_then(|v| v.to_str().ok()),
            Some("default-anon")
        );

        let payload = json_body(resp).await;
        assert_eq!(payload["object"], "chat.completion");
        assert_eq!(payload["choices"][0]["message"]["content"], "Hi");
        assert_eq!(payload["choices"][0]["finish_reason"], "stop");
        assert_eq!(payload["usage"]["prompt_tokens"], 2);
        assert_eq!(payload["session_id"], session_id.as_str());

        let info = state
            .sessions
            .get(&session_id)
            .await
            .expect("get")
            .expect("session");
        assert_eq!(info.cli_session_id.as_deref(), Some("cli-123"));
        assert_eq!(info.message_count, 2);
        assert_eq!(state.orchestrator.tracked_count().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streaming_completion_emits_chunks_and_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), fake_cli(dir.path(), HAPPY_CLI));
        let app = app_router(state.clone());
        let resp = app
            .oneshot(chat_request(json!({
                "stream": true,
                "streaming_mode": "message",
                "messages": [{"role": "user", "content": "say hi"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        assert_eq!(
            resp.headers().get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
            Some("no-cache")
        );
        assert!(resp.headers().contains_key("x-session-id"));

        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        let data = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect::<Vec<_>>();
        assert_eq!(data.last(), Some(&"[DONE]"));
        let chunks = data[..data.len() - 1]
            .iter()
            .map(|d| serde_json::from_str::<Value>(d).expect("chunk json"))
            .collect::<Vec<_>>();
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert!(chunks
            .iter()
            .any(|c| c["choices"][0]["delta"]["content"] == "Hi"));
        assert_eq!(chunks.last().expect("stop")["choices"][0]["finish_reason"], "stop");
        assert_eq!(state.streams.active_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_cli_maps_to_process_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = fake_cli(dir.path(), "echo 'auth token expired' >&2\nexit 2");
        let app = app_router(test_state(dir.path(), cli));
        let resp = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let payload = json_body(resp).await;
        assert_eq!(payload["error"]["code"], "process_failed");
        let message = payload["error"]["message"].as_str().expect("message");
        assert!(message.contains("exit code 2"), "{message}");
        assert!(message.contains("auth token expired"), "{message}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_session_is_a_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), fake_cli(dir.path(), "exec sleep 30"));
        let handle = state
            .orchestrator
            .create_or_resume(LaunchRequest {
                session_id: "busy-1".to_string(),
                project_path: dir.path().to_path_buf(),
                prompt: "first".to_string(),
                ..Default::default()
            })
            .await
            .expect("spawn");

        let app = app_router(state.clone());
        let resp = app
            .oneshot(chat_request(json!({
                "session_id": "busy-1",
                "messages": [{"role": "user", "content": "second"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["error"]["code"], "session_busy");
        assert_eq!(state.orchestrator.tracked_count().await, 1);

        let app = app_router(state.clone());
        let req = Request::builder()
            .method("DELETE")
            .uri("/v1/chat/completions/busy-1")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["process_stopped"], true);
        assert!(handle.is_terminal());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capacity_rejection_leaves_session_history_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(GatewayConfig {
            max_concurrent: 1,
            ..test_config(dir.path(), fake_cli(dir.path(), "exec sleep 30"))
        });
        let occupant = state
            .orchestrator
            .create_or_resume(LaunchRequest {
                session_id: "occupant".to_string(),
                project_path: dir.path().to_path_buf(),
                prompt: "first".to_string(),
                ..Default::default()
            })
            .await
            .expect("spawn");
        let existing = state
            .sessions
            .create("demo", "claude-sonnet-4-20250514", None)
            .await
            .expect("create");

        let resp = app_router(state.clone())
            .oneshot(chat_request(json!({
                "session_id": existing,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["error"]["code"], "capacity_exceeded");
        let info = state
            .sessions
            .get(&existing)
            .await
            .expect("get")
            .expect("session kept");
        assert_eq!(info.message_count, 0);

        let resp = app_router(state.clone())
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.sessions.list().await.expect("list").len(), 1);

        state.orchestrator.finish(&occupant).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_non_streaming_request_releases_its_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chatty = r#"while true; do echo '{"type":"system","subtype":"tick"}'; sleep 0.2; done"#;
        let state = test_state(dir.path(), fake_cli(dir.path(), chatty));

        let pending = app_router(state.clone()).oneshot(chat_request(json!({
            "session_id": "walk-away",
            "messages": [{"role": "user", "content": "hello"}]
        })));
        let outcome = tokio::time::timeout(Duration::from_millis(500), pending).await;
        assert!(outcome.is_err(), "request should still be pending");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.orchestrator.tracked_count().await > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "process still tracked after the client went away"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!state.orchestrator.is_running("walk-away").await);

        let resp = app_router(state.clone())
            .oneshot(get("/v1/chat/completions/walk-away/status"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["is_running"], false);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_cli_times_out_non_streaming_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), fake_cli(dir.path(), "exec sleep 30"));
        let resp = app_router(state.clone())
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let payload = json_body(resp).await;
        assert_eq!(payload["error"]["code"], "stream_timeout");
        assert_eq!(payload["error"]["type"], "timeout_error");
        assert_eq!(state.orchestrator.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_session_routes_return_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), PathBuf::from("claude"));

        let resp = app_router(state.clone())
            .oneshot(get("/v1/chat/completions/nope/status"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"]["code"], "session_not_found");

        let req = Request::builder()
            .method("DELETE")
            .uri("/v1/chat/completions/nope")
            .body(Body::empty())
            .expect("request");
        let resp = app_router(state.clone()).oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app_router(state)
            .oneshot(get("/v1/sessions/nope"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_known_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), PathBuf::from("claude"));
        let session_id = state
            .sessions
            .create("demo", "claude-sonnet-4-20250514", None)
            .await
            .expect("create");

        let resp = app_router(state.clone())
            .oneshot(get(&format!("/v1/chat/completions/{session_id}/status")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload["project_id"], "demo");
        assert_eq!(payload["is_running"], false);

        let resp = app_router(state)
            .oneshot(get("/v1/sessions"))
            .await
            .expect("response");
        let payload = json_body(resp).await;
        assert_eq!(payload["data"][0]["session_id"], session_id.as_str());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn models_are_listed_with_cli_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), fake_cli(dir.path(), HAPPY_CLI));

        let resp = app_router(state.clone())
            .oneshot(get("/v1/models"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload["object"], "list");
        let models = payload["data"].as_array().expect("data");
        let sonnet = models
            .iter()
            .find(|m| m["id"] == "claude-sonnet-4-20250514")
            .expect("sonnet listed");
        assert_eq!(sonnet["owned_by"], "anthropic-claude-1.0.42");
        assert_eq!(models[0]["created"], MODELS_CREATED_BASE);

        let resp = app_router(state.clone())
            .oneshot(get("/v1/models/zai-org/GLM-4.5"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["id"], "zai-org/GLM-4.5");

        let resp = app_router(state)
            .oneshot(get("/v1/models/gpt-17"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"]["code"], "model_not_found");
    }

    #[tokio::test]
    async fn health_is_unavailable_without_cli() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), dir.path().join("no-such-cli"));
        let resp = app_router(state)
            .oneshot(get("/health"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let payload = json_body(resp).await;
        assert_eq!(payload["status"], "unhealthy");
        assert_eq!(payload["tracked_processes"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn health_reports_cli_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), fake_cli(dir.path(), HAPPY_CLI));
        let resp = app_router(state)
            .oneshot(get("/health"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload["status"], "healthy");
        assert_eq!(payload["claude_version"], "1.0.42 (Claude Code)");
    }

    #[tokio::test]
    async fn root_lists_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resp = app_router(test_state(dir.path(), PathBuf::from("claude")))
            .oneshot(get("/"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload["endpoints"]["chat_completions"], "/v1/chat/completions");
    }

    #[tokio::test]
    async fn maintenance_expires_idle_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(GatewayConfig {
            binary_path: PathBuf::from("claude"),
            project_root: dir.path().join("projects"),
            session_timeout_minutes: 0,
            ..Default::default()
        });
        state
            .sessions
            .create("demo", "m", None)
            .await
            .expect("create");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (reaped, expired) = run_maintenance(&state).await;
        assert_eq!((reaped, expired), (0, 1));
    }

    #[test]
    fn default_project_id_uses_user_when_present() {
        assert_eq!(default_project_id(Some("alice")), "default-alice");
        assert_eq!(default_project_id(Some("  ")), "default-anon");
        assert_eq!(default_project_id(None), "default-anon");
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cligate_runtime::{OrchestratorConfig, PollPolicy, ProcessOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Per-provider overrides layered over the built-in provider table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub binary_path: PathBuf,
    pub default_model: String,
    pub max_concurrent: usize,
    pub project_root: PathBuf,
    pub include_partial_messages: bool,
    pub extra_args: Vec<String>,
    pub output_poll_timeout_ms: u64,
    pub max_output_timeouts: u32,
    pub stop_grace_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_collected_events: usize,
    pub heartbeat_interval_secs: u64,
    pub default_streaming_delay_ms: u64,
    pub reaper_interval_secs: u64,
    pub session_timeout_minutes: u64,
    pub log_retention_days: u64,
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            binary_path: PathBuf::from("claude"),
            default_model: DEFAULT_MODEL.to_string(),
            max_concurrent: cligate_runtime::DEFAULT_MAX_CONCURRENT,
            project_root: std::env::temp_dir().join("cligate_projects"),
            include_partial_messages: true,
            extra_args: Vec::new(),
            output_poll_timeout_ms: 10_000,
            max_output_timeouts: 3,
            stop_grace_ms: 3_000,
            shutdown_timeout_ms: 10_000,
            max_collected_events: 1_000,
            heartbeat_interval_secs: 30,
            default_streaming_delay_ms: 20,
            reaper_interval_secs: 60,
            session_timeout_minutes: 30,
            log_retention_days: 14,
            providers: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            poll_timeout: Duration::from_millis(self.output_poll_timeout_ms.max(1)),
            max_timeouts: self.max_output_timeouts.max(1),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            binary: self.binary_path.clone(),
            max_concurrent: self.max_concurrent.max(1),
            include_partial_messages: self.include_partial_messages,
            extra_args: self.extra_args.clone(),
            process: ProcessOptions {
                poll: self.poll_policy(),
                stop_grace: Duration::from_millis(self.stop_grace_ms),
            },
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn default_streaming_delay(&self) -> Duration {
        Duration::from_millis(self.default_streaming_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: config file, then `CLIGATE_*` environment,
/// then command-line overrides, each deep-merged over built-in defaults.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: ConfigLayers,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_json_file(&path).await?;
        Ok(Self {
            path,
            layers: ConfigLayers {
                file,
                env: env_layer(),
                cli: cli_overrides.unwrap_or_else(empty_object),
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> GatewayConfig {
        let merged = self.get_effective_value();
        serde_json::from_value(merged).unwrap_or_else(|err| {
            tracing::warn!("invalid gateway config, using defaults: {}", err);
            GatewayConfig::default()
        })
    }

    pub fn get_effective_value(&self) -> Value {
        let mut merged = serde_json::to_value(GatewayConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &self.layers.file);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }

    pub fn get_layers_value(&self) -> Value {
        json!({
            "file": self.layers.file,
            "env": self.layers.env,
            "cli": self.layers.cli,
        })
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable config file");
            Ok(empty_object())
        }
    }
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(binary) = get("CLIGATE_CLAUDE_BINARY").or_else(|| get("CLAUDE_BINARY_PATH")) {
        deep_merge(&mut root, &json!({ "binary_path": binary }));
    }
    if let Some(model) = get("CLIGATE_DEFAULT_MODEL") {
        deep_merge(&mut root, &json!({ "default_model": model }));
    }
    if let Some(host) = get("CLIGATE_HOST") {
        deep_merge(&mut root, &json!({ "host": host }));
    }
    if let Some(port) = get("CLIGATE_PORT").and_then(|v| v.parse::<u16>().ok()) {
        deep_merge(&mut root, &json!({ "port": port }));
    }
    if let Some(max) = get("CLIGATE_MAX_CONCURRENT").and_then(|v| v.parse::<usize>().ok()) {
        deep_merge(&mut root, &json!({ "max_concurrent": max }));
    }
    if let Some(root_dir) = get("CLIGATE_PROJECT_ROOT") {
        deep_merge(&mut root, &json!({ "project_root": root_dir }));
    }
    if let Some(partial) = get("CLIGATE_PARTIAL_MESSAGES").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "include_partial_messages": partial }));
    }
    if let Some(minutes) = get("CLIGATE_SESSION_TIMEOUT_MINUTES").and_then(|v| v.parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "session_timeout_minutes": minutes }));
    }
    if let Some(base_url) = get("ANTHROPIC_BASE_URL") {
        deep_merge(
            &mut root,
            &json!({ "providers": { "anthropic": { "base_url": base_url } } }),
        );
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

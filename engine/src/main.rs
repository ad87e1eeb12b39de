use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use cligate_core::ConfigStore;
use cligate_observability::{canonical_logs_dir_from_root, emit_event, init_logging, ObservabilityEvent};
use cligate_runtime::ProcessOrchestrator;
use cligate_server::{serve, AppState};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "cligate-engine")]
#[command(about = "OpenAI-compatible gateway for a headless coding CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, env = "CLIGATE_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Path to the CLI executable.
        #[arg(long)]
        binary: Option<String>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Model used when a request does not name one.
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the gateway version and the version reported by the CLI.
    Version {
        #[arg(long)]
        binary: Option<String>,
        #[arg(long, env = "CLIGATE_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            binary,
            max_concurrent,
            model,
        } => {
            let overrides = build_cli_overrides(hostname, port, binary, max_concurrent, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("config.json"));
            let store = ConfigStore::new(&config_path, overrides)
                .await
                .with_context(|| format!("failed to load config {}", config_path.display()))?;
            let gateway_config = store.get();

            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_logging(&logs_dir, gateway_config.log_retention_days)?;
            emit_event(
                tracing::Level::INFO,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some(log_info.logs_dir.as_str()),
                    ..ObservabilityEvent::new("logging.initialized", "engine.main")
                },
            );

            let addr: SocketAddr = format!("{}:{}", gateway_config.host, gateway_config.port)
                .parse()
                .context("invalid hostname or port")?;
            let startup_attempt_id = Uuid::new_v4().to_string();
            log_startup_paths(store.path(), &state_dir, &addr, &startup_attempt_id);
            info!(
                binary = %gateway_config.binary_path.display(),
                default_model = %gateway_config.default_model,
                max_concurrent = gateway_config.max_concurrent,
                project_root = %gateway_config.project_root.display(),
                "gateway configured"
            );

            let state = AppState::new(gateway_config);
            match state.orchestrator.version().await {
                Ok(version) => info!(%version, "cli available"),
                Err(err) => tracing::warn!("cli not available yet: {err:#}"),
            }
            serve(addr, state).await?;
        }
        Command::Version {
            binary,
            state_dir,
            config,
        } => {
            let overrides = build_cli_overrides(None, None, binary, None, None)?;
            let state_dir = resolve_state_dir(state_dir);
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("config.json"));
            let store = ConfigStore::new(&config_path, overrides).await?;
            let orchestrator = ProcessOrchestrator::new(store.get().orchestrator_config());
            let cli_version = orchestrator.version().await;
            let output = json!({
                "cligate": env!("CARGO_PKG_VERSION"),
                "cli": cli_version.as_ref().ok(),
                "cli_error": cli_version.as_ref().err().map(|e| format!("{e:#}")),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn build_cli_overrides(
    hostname: Option<String>,
    port: Option<u16>,
    binary: Option<String>,
    max_concurrent: Option<usize>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let mut root = Map::new();
    if let Some(hostname) = hostname {
        let hostname = hostname.trim().to_string();
        if hostname.is_empty() {
            anyhow::bail!("hostname cannot be empty");
        }
        root.insert("host".to_string(), Value::String(hostname));
    }
    if let Some(port) = port {
        root.insert("port".to_string(), json!(port));
    }
    if let Some(binary) = binary.filter(|b| !b.trim().is_empty()) {
        root.insert("binary_path".to_string(), Value::String(binary));
    }
    if let Some(max) = max_concurrent {
        if max == 0 {
            anyhow::bail!("max-concurrent must be at least 1");
        }
        root.insert("max_concurrent".to_string(), json!(max));
    }
    if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
        root.insert("default_model".to_string(), Value::String(model));
    }
    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(root)))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .map(|d| d.join("cligate"))
        .unwrap_or_else(|| PathBuf::from(".cligate"))
}

fn log_startup_paths(config_path: &Path, state_dir: &Path, addr: &SocketAddr, startup_attempt_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting cligate-engine on http://{addr}");
    info!(
        "startup paths: attempt_id={} exe={} cwd={} state_dir={} config_path={}",
        startup_attempt_id,
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}

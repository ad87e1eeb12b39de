use std::sync::Arc;

use chrono::{DateTime, Utc};
use cligate_core::{
    GatewayConfig, MemorySessionStore, ProjectWorkspace, ProviderRegistry, SessionStore,
    StreamRegistry,
};
use cligate_runtime::ProcessOrchestrator;

mod http;

pub use http::{app_router, run_maintenance, serve};

/// Everything a request handler needs. Cheap to clone; all registries are
/// shared behind `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub orchestrator: ProcessOrchestrator,
    pub sessions: Arc<dyn SessionStore>,
    pub providers: Arc<ProviderRegistry>,
    pub projects: ProjectWorkspace,
    pub streams: StreamRegistry,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_session_store(config, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_session_store(config: GatewayConfig, sessions: Arc<dyn SessionStore>) -> Self {
        let orchestrator = ProcessOrchestrator::new(config.orchestrator_config());
        let providers = Arc::new(ProviderRegistry::from_config(&config.providers));
        let projects = ProjectWorkspace::new(config.project_root.clone());
        Self {
            config: Arc::new(config),
            orchestrator,
            sessions,
            providers,
            projects,
            streams: StreamRegistry::new(),
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cligate_types::{SessionInfo, SessionUpdate};
use tokio::sync::RwLock;

/// Session bookkeeping consumed by the gateway. The in-memory store below is
/// the default; anything persistent plugs in behind the same trait.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(
        &self,
        project_id: &str,
        model: &str,
        system_prompt: Option<&str>,
    ) -> anyhow::Result<String>;

    /// Records a session whose id was chosen elsewhere (e.g. a CLI session
    /// being resumed that this gateway has never seen).
    async fn register(&self, session: SessionInfo) -> anyhow::Result<()>;

    async fn get(&self, session_id: &str) -> anyhow::Result<Option<SessionInfo>>;

    async fn update(&self, session_id: &str, update: SessionUpdate) -> anyhow::Result<bool>;

    async fn end(&self, session_id: &str) -> anyhow::Result<bool>;

    /// Forgets a session outright, used when its first turn never started.
    async fn remove(&self, session_id: &str) -> anyhow::Result<bool>;

    async fn list(&self) -> anyhow::Result<Vec<SessionInfo>>;

    /// Drops sessions idle for longer than `max_idle`, returning their ids.
    async fn cleanup_expired(&self, max_idle: Duration) -> anyhow::Result<Vec<String>>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(
        &self,
        project_id: &str,
        model: &str,
        system_prompt: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut session = SessionInfo::new(project_id, model);
        session.system_prompt = system_prompt.map(str::to_string);
        let id = session.session_id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        tracing::info!(session_id = %id, project_id, model, "created session");
        Ok(id)
    }

    async fn register(&self, session: SessionInfo) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .entry(session.session_id.clone())
            .or_insert(session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> anyhow::Result<Option<SessionInfo>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn update(&self, session_id: &str, update: SessionUpdate) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        session.apply(&update);
        Ok(true)
    }

    async fn end(&self, session_id: &str) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        session.is_active = false;
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn remove(&self, session_id: &str) -> anyhow::Result<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn list(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let mut sessions = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn cleanup_expired(&self, max_idle: Duration) -> anyhow::Result<Vec<String>> {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - max_idle;
        let mut sessions = self.sessions.write().await;
        let expired = sessions
            .iter()
            .filter(|(_, s)| s.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired)
    }
}

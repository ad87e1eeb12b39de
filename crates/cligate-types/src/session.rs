use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Gateway-side bookkeeping for one resumable conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_id: String,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Id the CLI assigned to this conversation, used for `--resume`.
    pub cli_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub is_active: bool,
}

impl SessionInfo {
    pub fn new(project_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), project_id, model)
    }

    pub fn with_id(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            model: model.into(),
            system_prompt: None,
            cli_session_id: None,
            created_at: now,
            updated_at: now,
            message_count: 0,
            total_tokens: 0,
            total_cost: 0.0,
            is_active: true,
        }
    }

    /// Id to pass to `--resume` when continuing this session.
    pub fn resume_target(&self) -> &str {
        self.cli_session_id.as_deref().unwrap_or(&self.session_id)
    }

    pub fn apply(&mut self, update: &SessionUpdate) {
        if update.message_content.is_some() {
            self.message_count += 1;
        }
        self.total_tokens += update.tokens_used;
        self.total_cost += update.cost;
        if let Some(cli_session_id) = update.cli_session_id.as_deref() {
            if !cli_session_id.is_empty() {
                self.cli_session_id = Some(cli_session_id.to_string());
            }
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub message_content: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    pub cli_session_id: Option<String>,
}

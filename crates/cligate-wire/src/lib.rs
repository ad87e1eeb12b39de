use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cligate_types::SessionInfo;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";
pub const DONE_SENTINEL: &str = "[DONE]";

/// `chatcmpl-` followed by 29 hex characters.
pub fn completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..29])
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    Character,
    Word,
    Sentence,
    #[default]
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl ChatContent {
    pub fn text(&self) -> String {
        match self {
            ChatContent::Text(text) => text.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(&self) -> String {
        self.content.as_ref().map(ChatContent::text).unwrap_or_default()
    }
}

/// Inbound `POST /v1/chat/completions` body. Sampling parameters are accepted
/// and ignored; the CLI has no equivalent knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub include_thoughts: Option<bool>,
    #[serde(default)]
    pub include_tool_calls: Option<bool>,
    #[serde(default)]
    pub include_metadata: Option<bool>,
    #[serde(default)]
    pub streaming_mode: Option<StreamingMode>,
    /// Seconds between emitted chunks.
    #[serde(default)]
    pub streaming_delay: Option<f64>,
    #[serde(default)]
    pub provider_model: Option<String>,
    #[serde(default)]
    pub provider_base_url: Option<String>,
    #[serde(default)]
    pub provider_api_key: Option<String>,
}

impl ChatCompletionRequest {
    /// Text of the last `user` message.
    pub fn last_user_prompt(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(ChatMessage::text)
    }

    /// First `system` message, falling back to the `system_prompt` extension.
    pub fn effective_system_prompt(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == "system")
            .map(ChatMessage::text)
            .or_else(|| self.system_prompt.clone())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    fn with_delta(
        id: &str,
        created: i64,
        model: &str,
        delta: ChunkDelta,
        finish_reason: Option<&str>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    /// Opening chunk announcing the assistant role.
    pub fn role(id: &str, created: i64, model: &str) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
            },
            None,
        )
    }

    pub fn content(id: &str, created: i64, model: &str, text: impl Into<String>) -> Self {
        Self::with_delta(
            id,
            created,
            model,
            ChunkDelta {
                role: None,
                content: Some(text.into()),
            },
            None,
        )
    }

    pub fn stop(id: &str, created: i64, model: &str) -> Self {
        Self::with_delta(id, created, model, ChunkDelta::default(), Some("stop"))
    }

    pub fn delta_text(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl ChatCompletion {
    pub fn new(model: &str, content: String, usage: Usage) -> Self {
        Self {
            id: completion_id(),
            object: COMPLETION_OBJECT.to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage,
            session_id: None,
            project_id: None,
        }
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

/// `{"error": {"message", "type", "code"}}`, used both as an HTTP body and
/// as an in-band SSE error chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub error: WireErrorDetail,
}

impl WireError {
    pub fn new(message: impl Into<String>, kind: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: WireErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code: code.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireModel {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireModelList {
    pub object: String,
    pub data: Vec<WireModel>,
}

/// `GET /v1/chat/completions/{id}/status` body.
#[derive(Debug, Clone, Serialize)]
pub struct WireSessionStatus {
    pub session_id: String,
    pub project_id: Option<String>,
    pub model: Option<String>,
    pub is_active: bool,
    pub is_running: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub message_count: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl WireSessionStatus {
    pub fn from_session(info: Option<&SessionInfo>, session_id: &str, is_running: bool) -> Self {
        match info {
            Some(info) => Self {
                session_id: info.session_id.clone(),
                project_id: Some(info.project_id.clone()),
                model: Some(info.model.clone()),
                is_active: info.is_active,
                is_running,
                created_at: Some(info.created_at.to_rfc3339()),
                updated_at: Some(info.updated_at.to_rfc3339()),
                message_count: info.message_count,
                total_tokens: info.total_tokens,
                total_cost: info.total_cost,
            },
            None => Self {
                session_id: session_id.to_string(),
                project_id: None,
                model: None,
                is_active: is_running,
                is_running,
                created_at: None,
                updated_at: None,
                message_count: 0,
                total_tokens: 0,
                total_cost: 0.0,
            },
        }
    }
}

pub fn value_of<T: Serialize>(item: &T) -> Value {
    serde_json::to_value(item).unwrap_or(Value::Null)
}

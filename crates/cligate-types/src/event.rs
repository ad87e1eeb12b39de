use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Assistant/user content as emitted by the CLI: either a bare string or a
/// list of typed blocks (`{"type":"text","text":"..."}`, `tool_use`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(text)) => MessageContent::Text(text.clone()),
            Some(raw @ Value::Array(_)) => serde_json::from_value(raw.clone()).unwrap_or_default(),
            _ => MessageContent::default(),
        }
    }
}

/// Text carried by a content value.
///
/// A plain string is returned as-is. For block lists the first `text` block
/// with non-empty text wins; everything else yields an empty string.
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text.as_deref().filter(|t| !t.is_empty()))
            .map(str::to_string)
            .unwrap_or_default(),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSummary {
    pub is_error: bool,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub usage: Option<Value>,
}

/// One unit of the CLI's line-delimited output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    Assistant {
        content: MessageContent,
        partial: bool,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        tool_name: String,
        arguments: Value,
    },
    ToolResult {
        tool_name: String,
        result: Value,
    },
    Error {
        message: String,
        error_type: Option<String>,
    },
    System {
        subtype: Option<String>,
        raw: Value,
    },
    User {
        content: MessageContent,
    },
    Result(ResultSummary),
    Text {
        content: String,
    },
    Unknown {
        kind: Option<String>,
        raw: Value,
    },
}

impl CliEvent {
    pub fn error(message: impl Into<String>, error_type: Option<&str>) -> Self {
        CliEvent::Error {
            message: message.into(),
            error_type: error_type.map(str::to_string),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CliEvent::Assistant { .. } => "assistant",
            CliEvent::Thinking { .. } => "thinking",
            CliEvent::ToolCall { .. } => "tool_call",
            CliEvent::ToolResult { .. } => "tool_result",
            CliEvent::Error { .. } => "error",
            CliEvent::System { .. } => "system",
            CliEvent::User { .. } => "user",
            CliEvent::Result(_) => "result",
            CliEvent::Text { .. } => "text",
            CliEvent::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub event: CliEvent,
    /// Session id the CLI reported on this line, if any.
    pub session_id: Option<String>,
}

/// Parse one stdout line. Never fails: lines that are not JSON objects become
/// `Text` events.
pub fn parse_line(line: &str) -> ParsedLine {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => value,
        _ => {
            return ParsedLine {
                event: CliEvent::Text {
                    content: line.to_string(),
                },
                session_id: None,
            }
        }
    };
    let session_id = value
        .get("session_id")
        .or_else(|| value.get("sessionId"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    ParsedLine {
        event: event_from_value(value),
        session_id,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn message_content(value: &Value) -> MessageContent {
    let nested = value.get("message").and_then(|m| m.get("content"));
    MessageContent::from_value(nested.or_else(|| value.get("content")))
}

fn event_from_value(value: Value) -> CliEvent {
    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match kind {
        "assistant" => CliEvent::Assistant {
            content: message_content(&value),
            partial: value
                .get("partial")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        },
        "thinking" => CliEvent::Thinking {
            content: str_field(&value, "content").unwrap_or_default(),
        },
        "tool_call" => CliEvent::ToolCall {
            tool_name: str_field(&value, "tool_name").unwrap_or_else(|| "unknown".to_string()),
            arguments: value.get("arguments").cloned().unwrap_or_else(|| json!({})),
        },
        "tool_result" => CliEvent::ToolResult {
            tool_name: str_field(&value, "tool_name").unwrap_or_else(|| "unknown".to_string()),
            result: value.get("result").cloned().unwrap_or(Value::Null),
        },
        "error" => CliEvent::Error {
            message: value
                .get("error")
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "Unknown error".to_string()),
            error_type: str_field(&value, "error_type"),
        },
        "system" => CliEvent::System {
            subtype: str_field(&value, "subtype"),
            raw: value,
        },
        "user" => CliEvent::User {
            content: message_content(&value),
        },
        "result" => CliEvent::Result(ResultSummary {
            is_error: value
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            result: str_field(&value, "result"),
            duration_ms: value.get("duration_ms").and_then(|v| v.as_u64()),
            cost_usd: value
                .get("total_cost_usd")
                .or_else(|| value.get("cost_usd"))
                .and_then(|v| v.as_f64()),
            usage: value.get("usage").cloned().filter(|u| !u.is_null()),
        }),
        _ => CliEvent::Unknown {
            kind: (!kind.is_empty()).then(|| kind.to_string()),
            raw: value,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_json_line_becomes_text_event() {
        let parsed = parse_line("Loading workspace...");
        assert_eq!(
            parsed.event,
            CliEvent::Text {
                content: "Loading workspace...".to_string()
            }
        );
        assert!(parsed.session_id.is_none());
    }

    #[test]
    fn json_scalar_line_becomes_text_event() {
        let parsed = parse_line("42");
        assert_eq!(parsed.event.kind(), "text");
    }

    #[test]
    fn assistant_content_prefers_message_content() {
        let parsed = parse_line(
            r#"{"type":"assistant","message":{"content":"nested"},"content":"top","partial":true}"#,
        );
        match parsed.event {
            CliEvent::Assistant { content, partial } => {
                assert_eq!(extract_text(&content), "nested");
                assert!(partial);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn assistant_content_falls_back_to_top_level() {
        let parsed = parse_line(r#"{"type":"assistant","content":"top"}"#);
        match parsed.event {
            CliEvent::Assistant { content, partial } => {
                assert_eq!(extract_text(&content), "top");
                assert!(!partial);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn extract_text_takes_first_non_empty_text_block() {
        let content = MessageContent::from_value(Some(&json!([
            {"type": "tool_use", "name": "bash"},
            {"type": "text", "text": ""},
            {"type": "text", "text": "second"},
            {"type": "text", "text": "third"}
        ])));
        assert_eq!(extract_text(&content), "second");
    }

    #[test]
    fn extract_text_without_text_blocks_is_empty() {
        let content = MessageContent::from_value(Some(&json!([{"type": "image"}])));
        assert_eq!(extract_text(&content), "");
        assert_eq!(extract_text(&MessageContent::from_value(None)), "");
    }

    #[test]
    fn session_id_is_reported_from_either_key() {
        let parsed = parse_line(r#"{"type":"system","subtype":"init","session_id":"abc"}"#);
        assert_eq!(parsed.session_id.as_deref(), Some("abc"));
        let parsed = parse_line(r#"{"type":"system","sessionId":"def"}"#);
        assert_eq!(parsed.session_id.as_deref(), Some("def"));
        let parsed = parse_line(r#"{"type":"system","session_id":"  "}"#);
        assert!(parsed.session_id.is_none());
    }

    #[test]
    fn tool_events_default_missing_fields() {
        let parsed = parse_line(r#"{"type":"tool_call"}"#);
        assert_eq!(
            parsed.event,
            CliEvent::ToolCall {
                tool_name: "unknown".to_string(),
                arguments: json!({})
            }
        );
        let parsed = parse_line(r#"{"type":"error"}"#);
        assert_eq!(parsed.event, CliEvent::error("Unknown error", None));
    }

    #[test]
    fn result_event_reads_summary_fields() {
        let parsed = parse_line(
            r#"{"type":"result","is_error":true,"result":"boom","duration_ms":12,"total_cost_usd":0.5,"usage":{"input_tokens":3}}"#,
        );
        match parsed.event {
            CliEvent::Result(summary) => {
                assert!(summary.is_error);
                assert_eq!(summary.result.as_deref(), Some("boom"));
                assert_eq!(summary.duration_ms, Some(12));
                assert_eq!(summary.cost_usd, Some(0.5));
                assert_eq!(summary.usage, Some(json!({"input_tokens": 3})));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unrecognized_type_is_kept_as_unknown() {
        let parsed = parse_line(r#"{"type":"stream_event","event":{}}"#);
        match parsed.event {
            CliEvent::Unknown { kind, raw } => {
                assert_eq!(kind.as_deref(), Some("stream_event"));
                assert!(raw.get("event").is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

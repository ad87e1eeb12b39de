use cligate_types::CliEvent;
use serde_json::Value;

/// Which ancillary event kinds are rendered into the response text.
/// Assistant text is always included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InclusionPolicy {
    pub include_thoughts: bool,
    pub include_tool_calls: bool,
    pub include_metadata: bool,
}

impl InclusionPolicy {
    pub fn from_flags(thoughts: Option<bool>, tool_calls: Option<bool>, metadata: Option<bool>) -> Self {
        Self {
            include_thoughts: thoughts.unwrap_or(false),
            include_tool_calls: tool_calls.unwrap_or(false),
            include_metadata: metadata.unwrap_or(false),
        }
    }
}

/// Markdown block for a non-assistant event, or `None` when the policy
/// excludes it or the kind is never shown.
pub fn render_ancillary(event: &CliEvent, policy: &InclusionPolicy) -> Option<String> {
    match event {
        CliEvent::Thinking { content } if policy.include_thoughts => {
            Some(format!("\n\n💭 **Thinking:** {content}\n\n"))
        }
        CliEvent::ToolCall {
            tool_name,
            arguments,
        } if policy.include_tool_calls => {
            let mut block = format!("\n\n🔧 **Tool Call:** {tool_name}");
            if has_arguments(arguments) {
                let pretty = serde_json::to_string_pretty(arguments)
                    .unwrap_or_else(|_| arguments.to_string());
                block.push_str(&format!("\n**Arguments:** {pretty}"));
            }
            block.push_str("\n\n");
            Some(block)
        }
        CliEvent::ToolResult { result, .. } if policy.include_tool_calls => {
            let text = match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(format!("\n\n📋 **Tool Result:**\n{text}\n\n"))
        }
        CliEvent::Error { message, .. } if policy.include_metadata => {
            Some(format!("\n\n❌ **Error:** {message}\n\n"))
        }
        _ => None,
    }
}

fn has_arguments(arguments: &Value) -> bool {
    match arguments {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all() -> InclusionPolicy {
        InclusionPolicy {
            include_thoughts: true,
            include_tool_calls: true,
            include_metadata: true,
        }
    }

    #[test]
    fn default_policy_hides_everything() {
        let policy = InclusionPolicy::default();
        let thinking = CliEvent::Thinking {
            content: "hmm".to_string(),
        };
        assert_eq!(render_ancillary(&thinking, &policy), None);
        assert_eq!(render_ancillary(&CliEvent::error("boom", None), &policy), None);
    }

    #[test]
    fn tool_call_omits_empty_arguments() {
        let call = CliEvent::ToolCall {
            tool_name: "Read".to_string(),
            arguments: json!({}),
        };
        assert_eq!(
            render_ancillary(&call, &all()).as_deref(),
            Some("\n\n🔧 **Tool Call:** Read\n\n")
        );

        let call = CliEvent::ToolCall {
            tool_name: "Read".to_string(),
            arguments: json!({"path": "a.rs"}),
        };
        let rendered = render_ancillary(&call, &all()).expect("rendered");
        assert!(rendered.starts_with("\n\n🔧 **Tool Call:** Read\n**Arguments:** {\n"));
        assert!(rendered.contains("\"path\": \"a.rs\""));
        assert!(rendered.ends_with("}\n\n"));
    }

    #[test]
    fn tool_result_prints_strings_verbatim() {
        let result = CliEvent::ToolResult {
            tool_name: "Bash".to_string(),
            result: json!("ok"),
        };
        assert_eq!(
            render_ancillary(&result, &all()).as_deref(),
            Some("\n\n📋 **Tool Result:**\nok\n\n")
        );
        let result = CliEvent::ToolResult {
            tool_name: "Bash".to_string(),
            result: json!({"exit": 0}),
        };
        assert_eq!(
            render_ancillary(&result, &all()).as_deref(),
            Some("\n\n📋 **Tool Result:**\n{\"exit\":0}\n\n")
        );
    }

    #[test]
    fn errors_and_thoughts_follow_their_flags() {
        let policy = InclusionPolicy::from_flags(Some(true), None, Some(true));
        assert_eq!(
            render_ancillary(&CliEvent::error("boom", None), &policy).as_deref(),
            Some("\n\n❌ **Error:** boom\n\n")
        );
        let thinking = CliEvent::Thinking {
            content: "plan".to_string(),
        };
        assert_eq!(
            render_ancillary(&thinking, &policy).as_deref(),
            Some("\n\n💭 **Thinking:** plan\n\n")
        );
        let call = CliEvent::ToolCall {
            tool_name: "Read".to_string(),
            arguments: json!({}),
        };
        assert_eq!(render_ancillary(&call, &policy), None);
    }
}

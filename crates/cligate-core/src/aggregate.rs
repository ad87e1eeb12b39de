use cligate_runtime::{EventStream, ExitOutcome, StreamEnd};
use cligate_types::{extract_text, CliEvent, ResultSummary};
use cligate_wire::{ChatCompletion, Usage};

use crate::error::{GatewayError, Result};
use crate::render::{render_ancillary, InclusionPolicy};

pub const EMPTY_CONTENT_PLACEHOLDER: &str = "Response received but content was empty.";
pub const DEFAULT_MAX_COLLECTED_EVENTS: usize = 1000;

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub model: String,
    pub inclusion: InclusionPolicy,
    pub max_events: usize,
}

impl AggregateOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            inclusion: InclusionPolicy::default(),
            max_events: DEFAULT_MAX_COLLECTED_EVENTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Aggregated {
    pub completion: ChatCompletion,
    pub summary: Option<ResultSummary>,
    pub events_seen: usize,
}

struct Part {
    text: String,
    assistant: bool,
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Collects a whole response from `events`: until a result event, the
/// event cap, or the end of the sequence.
pub async fn aggregate(
    mut events: EventStream,
    prompt: &str,
    options: &AggregateOptions,
) -> Result<Aggregated> {
    let mut parts: Vec<Part> = Vec::new();
    let mut summary = None;
    let mut events_seen = 0usize;

    while let Some(event) = events.next().await {
        events_seen += 1;
        match &event {
            CliEvent::Result(result) => {
                summary = Some(result.clone());
                break;
            }
            CliEvent::Assistant { content, .. } => {
                let text = extract_text(content);
                if !text.trim().is_empty() {
                    match parts.last_mut() {
                        Some(last) if last.assistant && text.starts_with(last.text.as_str()) => {
                            last.text = text;
                        }
                        _ => parts.push(Part {
                            text,
                            assistant: true,
                        }),
                    }
                }
            }
            other => {
                if let Some(text) = render_ancillary(other, &options.inclusion) {
                    parts.push(Part {
                        text,
                        assistant: false,
                    });
                } else {
                    tracing::debug!(kind = other.kind(), "not included in response");
                }
            }
        }
        if events_seen >= options.max_events {
            tracing::warn!(limit = options.max_events, "event cap reached; returning partial response");
            break;
        }
    }

    if summary.is_none() {
        match events.end_reason() {
            Some(StreamEnd::TimedOut) => return Err(GatewayError::StreamTimeout),
            Some(StreamEnd::Closed(ExitOutcome::Failed { code })) => {
                return Err(GatewayError::ProcessFailure { code, detail: None })
            }
            _ => {}
        }
    }

    let content = parts
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    let content = if content.is_empty() {
        EMPTY_CONTENT_PLACEHOLDER.to_string()
    } else {
        content
    };
    let usage = Usage::new(word_count(prompt), word_count(&content));
    Ok(Aggregated {
        completion: ChatCompletion::new(&options.model, content, usage),
        summary,
        events_seen,
    })
}

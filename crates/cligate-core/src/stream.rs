use std::time::Duration;

use cligate_runtime::{EventStream, ExitOutcome, StreamEnd};
use cligate_types::{extract_text, CliEvent};
use cligate_wire::{completion_id, unix_now, ChatCompletionChunk, StreamingMode, WireError, DONE_SENTINEL};
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::chunking::plan_chunks;
use crate::error::GatewayError;
use crate::registry::StreamGuard;
use crate::render::{render_ancillary, InclusionPolicy};

/// One SSE `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Chunk(ChatCompletionChunk),
    Error(WireError),
    Done,
}

impl SseFrame {
    pub fn data(&self) -> serde_json::Result<String> {
        match self {
            SseFrame::Chunk(chunk) => serde_json::to_string(chunk),
            SseFrame::Error(err) => serde_json::to_string(err),
            SseFrame::Done => Ok(DONE_SENTINEL.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub model: String,
    pub mode: StreamingMode,
    pub delay: Duration,
    pub inclusion: InclusionPolicy,
}

impl ConversionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            mode: StreamingMode::default(),
            delay: Duration::ZERO,
            inclusion: InclusionPolicy::default(),
        }
    }
}

/// Request-supplied delay in seconds, falling back to `default` when absent
/// or not a usable duration.
pub fn delay_from_secs(secs: Option<f64>, default: Duration) -> Duration {
    secs.and_then(|s| Duration::try_from_secs_f64(s).ok())
        .unwrap_or(default)
}

enum Pull {
    Event(CliEvent),
    Ended,
    Cancelled,
}

async fn pull(events: &mut EventStream, cancel: Option<&CancellationToken>) -> Pull {
    let next = match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Pull::Cancelled,
            next = events.next() => next,
        },
        None => events.next().await,
    };
    match next {
        Some(event) => Pull::Event(event),
        None => Pull::Ended,
    }
}

/// Turns one process's events into OpenAI `chat.completion.chunk`s.
pub struct StreamConverter {
    id: String,
    created: i64,
    chunk_index: u64,
    accumulated: String,
    options: ConversionOptions,
}

impl StreamConverter {
    pub fn new(options: ConversionOptions) -> Self {
        Self {
            id: completion_id(),
            created: unix_now(),
            chunk_index: 0,
            accumulated: String::new(),
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.chunk_index
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn opening(&mut self) -> ChatCompletionChunk {
        self.chunk_index += 1;
        ChatCompletionChunk::role(&self.id, self.created, &self.options.model)
    }

    pub fn chunk(&mut self, text: &str) -> ChatCompletionChunk {
        self.chunk_index += 1;
        ChatCompletionChunk::content(&self.id, self.created, &self.options.model, text)
    }

    pub fn stop(&mut self) -> ChatCompletionChunk {
        self.chunk_index += 1;
        ChatCompletionChunk::stop(&self.id, self.created, &self.options.model)
    }

    /// New assistant text relative to what was already seen. `accumulated`
    /// always becomes `text`, whether or not it extended the previous value.
    pub fn assistant_delta(&mut self, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }
        let delta = match text.strip_prefix(self.accumulated.as_str()) {
            Some(suffix) => suffix.to_string(),
            None => text.to_string(),
        };
        self.accumulated = text.to_string();
        (!delta.is_empty()).then_some(delta)
    }

    /// Text to emit for `event`, if any. Result events are handled by the
    /// caller and yield nothing here.
    pub fn delta_for(&mut self, event: &CliEvent) -> Option<String> {
        match event {
            CliEvent::Assistant { content, .. } => self.assistant_delta(&extract_text(content)),
            CliEvent::Thinking { .. } | CliEvent::ToolCall { .. } | CliEvent::ToolResult { .. } => {
                render_ancillary(event, &self.options.inclusion)
            }
            CliEvent::Error { message, error_type } => {
                let rendered = render_ancillary(event, &self.options.inclusion);
                if rendered.is_none() {
                    tracing::warn!(
                        completion_id = %self.id,
                        error_type = error_type.as_deref().unwrap_or("unknown"),
                        "CLI reported error: {message}"
                    );
                }
                rendered
            }
            CliEvent::Result(_) => None,
            other => {
                tracing::debug!(completion_id = %self.id, kind = other.kind(), "skipping event");
                None
            }
        }
    }

    /// Drive `events` to completion as SSE frames: role chunk, content
    /// chunks, then either stop + `[DONE]` or an error frame + `[DONE]`.
    ///
    /// The guard, when given, lives as long as the returned stream and its
    /// cancellation ends the conversion early.
    pub fn into_frames(
        self,
        mut events: EventStream,
        guard: Option<StreamGuard>,
    ) -> impl Stream<Item = SseFrame> + Send + 'static {
        let mut converter = self;
        async_stream::stream! {
            let cancel = guard.as_ref().map(StreamGuard::cancellation);
            let _guard = guard;
            yield SseFrame::Chunk(converter.opening());

            let mut saw_result = false;
            let mut cancelled = false;
            loop {
                let event = match pull(&mut events, cancel.as_ref()).await {
                    Pull::Event(event) => event,
                    Pull::Ended => break,
                    Pull::Cancelled => {
                        cancelled = true;
                        break;
                    }
                };
                if let CliEvent::Result(summary) = &event {
                    if summary.is_error {
                        tracing::warn!(
                            completion_id = %converter.id,
                            result = summary.result.as_deref().unwrap_or(""),
                            "CLI finished with error result"
                        );
                    } else {
                        tracing::info!(
                            completion_id = %converter.id,
                            duration_ms = summary.duration_ms,
                            cost_usd = summary.cost_usd,
                            "CLI finished"
                        );
                    }
                    saw_result = true;
                    break;
                }
                let Some(text) = converter.delta_for(&event) else {
                    continue;
                };
                for piece in plan_chunks(&text, converter.options.mode, converter.options.delay) {
                    yield SseFrame::Chunk(converter.chunk(&piece.text));
                    if !piece.delay.is_zero() {
                        tokio::time::sleep(piece.delay).await;
                    }
                }
            }

            if !saw_result && !cancelled {
                let failure = match events.end_reason() {
                    Some(StreamEnd::TimedOut) => Some(GatewayError::StreamTimeout),
                    Some(StreamEnd::Closed(ExitOutcome::Failed { code })) => {
                        Some(GatewayError::ProcessFailure { code, detail: None })
                    }
                    _ => None,
                };
                if let Some(err) = failure {
                    tracing::warn!(completion_id = %converter.id, code = err.code(), "stream ended early: {err}");
                    yield SseFrame::Error(err.to_wire());
                    yield SseFrame::Done;
                    return;
                }
            }
            if cancelled {
                tracing::info!(completion_id = %converter.id, "stream cancelled");
            }
            yield SseFrame::Chunk(converter.stop());
            tracing::debug!(completion_id = %converter.id, chunks = converter.chunks_emitted(), "stream complete");
            yield SseFrame::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cligate_runtime::{event_channel, PollPolicy};
    use cligate_types::{parse_line, MessageContent, ResultSummary};
    use futures::StreamExt;

    fn assistant(text: &str) -> CliEvent {
        CliEvent::Assistant {
            content: MessageContent::Text(text.to_string()),
            partial: true,
        }
    }

    fn content_of(frames: &[SseFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                SseFrame::Chunk(c) if c.choices[0].delta.role.is_none() => {
                    c.delta_text().map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn superset_text_yields_only_suffix() {
        let mut converter = StreamConverter::new(ConversionOptions::new("m"));
        assert_eq!(converter.assistant_delta("Hello").as_deref(), Some("Hello"));
        assert_eq!(converter.assistant_delta("Hello world").as_deref(), Some(" world"));
        assert_eq!(converter.accumulated(), "Hello world");
    }

    #[test]
    fn unrelated_text_yields_whole_text_and_replaces_accumulated() {
        let mut converter = StreamConverter::new(ConversionOptions::new("m"));
        converter.assistant_delta("First message");
        assert_eq!(converter.assistant_delta("Second").as_deref(), Some("Second"));
        assert_eq!(converter.accumulated(), "Second");
        assert_eq!(converter.assistant_delta("Second"), None);
        assert_eq!(converter.assistant_delta("   "), None);
        assert_eq!(converter.accumulated(), "Second");
    }

    #[test]
    fn ancillary_blocks_do_not_touch_accumulated() {
        let mut options = ConversionOptions::new("m");
        options.inclusion.include_thoughts = true;
        let mut converter = StreamConverter::new(options);
        converter.assistant_delta("Hi");
        let thinking = CliEvent::Thinking {
            content: "hmm".to_string(),
        };
        assert!(converter.delta_for(&thinking).is_some());
        assert_eq!(converter.accumulated(), "Hi");
        assert_eq!(converter.delta_for(&CliEvent::error("x", None)), None);
    }

    #[tokio::test]
    async fn frames_end_with_stop_and_done_after_result() {
        let (tx, events) = event_channel(PollPolicy::default());
        tx.send(assistant("Hel"));
        tx.send(assistant("Hello"));
        tx.send(CliEvent::Result(ResultSummary::default()));
        tx.send(assistant("ignored after result"));
        tx.close(ExitOutcome::Completed);

        let frames = StreamConverter::new(ConversionOptions::new("m"))
            .into_frames(events, None)
            .collect::<Vec<_>>()
            .await;

        match &frames[0] {
            SseFrame::Chunk(c) => assert_eq!(c.choices[0].delta.role.as_deref(), Some("assistant")),
            other => panic!("unexpected opening frame {other:?}"),
        }
        assert_eq!(content_of(&frames), vec!["Hel".to_string(), "lo".to_string()]);
        let n = frames.len();
        match &frames[n - 2] {
            SseFrame::Chunk(c) => assert_eq!(c.choices[0].finish_reason.as_deref(), Some("stop")),
            other => panic!("expected stop chunk, got {other:?}"),
        }
        assert_eq!(frames[n - 1], SseFrame::Done);
        assert_eq!(frames[n - 1].data().expect("data"), "[DONE]");
    }

    #[tokio::test]
    async fn word_mode_splits_deltas() {
        let (tx, events) = event_channel(PollPolicy::default());
        tx.send(parse_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"one two three"}]}}"#).event);
        tx.send(CliEvent::Result(ResultSummary::default()));
        tx.close(ExitOutcome::Completed);

        let mut options = ConversionOptions::new("m");
        options.mode = StreamingMode::Word;
        let frames = StreamConverter::new(options)
            .into_frames(events, None)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(content_of(&frames), vec!["one", " two", " three"]);
    }

    #[tokio::test]
    async fn failed_process_emits_error_frame_without_stop() {
        let (tx, events) = event_channel(PollPolicy::default());
        tx.send(assistant("partial"));
        tx.send(CliEvent::error("Process failed with exit code 2", Some("process_failure")));
        tx.close(ExitOutcome::Failed { code: Some(2) });

        let frames = StreamConverter::new(ConversionOptions::new("m"))
            .into_frames(events, None)
            .collect::<Vec<_>>()
            .await;
        let n = frames.len();
        match &frames[n - 2] {
            SseFrame::Error(err) => assert_eq!(err.error.code, "process_failed"),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert_eq!(frames[n - 1], SseFrame::Done);
        assert!(frames.iter().all(|f| match f {
            SseFrame::Chunk(c) => c.choices[0].finish_reason.is_none(),
            _ => true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_output_emits_stream_timeout() {
        let (tx, events) = event_channel(PollPolicy {
            poll_timeout: Duration::from_secs(1),
            max_timeouts: 3,
        });
        tx.send(assistant("hi"));

        let frames = StreamConverter::new(ConversionOptions::new("m"))
            .into_frames(events, None)
            .collect::<Vec<_>>()
            .await;
        let n = frames.len();
        match &frames[n - 2] {
            SseFrame::Error(err) => {
                assert_eq!(err.error.code, "stream_timeout");
                assert_eq!(err.error.kind, "timeout_error");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        drop(tx);
    }

    #[tokio::test]
    async fn cancelled_guard_ends_stream_cleanly() {
        let registry = crate::registry::StreamRegistry::new();
        let guard = registry.register("s1", "m");
        let (tx, events) = event_channel(PollPolicy::default());
        tx.send(assistant("hi"));
        registry.cancel_session("s1");

        let frames = StreamConverter::new(ConversionOptions::new("m"))
            .into_frames(events, Some(guard))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(frames.last(), Some(&SseFrame::Done));
        assert_eq!(registry.active_count(), 0);
        drop(tx);
    }

    #[test]
    fn delay_falls_back_on_invalid_input() {
        let default = Duration::from_millis(20);
        assert_eq!(delay_from_secs(None, default), default);
        assert_eq!(delay_from_secs(Some(-1.0), default), default);
        assert_eq!(delay_from_secs(Some(f64::NAN), default), default);
        assert_eq!(delay_from_secs(Some(0.05), default), Duration::from_millis(50));
    }
}

use std::sync::OnceLock;
use std::time::Duration;

use cligate_wire::StreamingMode;
use regex::Regex;

const CHARACTER_DELAY_CAP: Duration = Duration::from_millis(10);

fn sentence_end() -> &'static Regex {
    static SENTENCE_END: OnceLock<Regex> = OnceLock::new();
    SENTENCE_END.get_or_init(|| Regex::new(r"[.!?。！？]\s*").expect("valid sentence regex"))
}

/// One emitted piece of a delta and the pause that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub text: String,
    pub delay: Duration,
}

impl PlannedChunk {
    fn new(text: impl Into<String>, delay: Duration) -> Self {
        Self {
            text: text.into(),
            delay,
        }
    }
}

/// Split `text` according to `mode`. Concatenating the chunk texts gives
/// back `text` for every mode except `word`, which normalizes whitespace.
pub fn plan_chunks(text: &str, mode: StreamingMode, base_delay: Duration) -> Vec<PlannedChunk> {
    if text.is_empty() {
        return Vec::new();
    }
    match mode {
        StreamingMode::Message => vec![PlannedChunk::new(text, Duration::ZERO)],
        StreamingMode::Character => {
            let delay = base_delay.min(CHARACTER_DELAY_CAP);
            text.chars()
                .map(|c| {
                    let pause = if matches!(c, ' ' | '\n' | '\t') {
                        Duration::ZERO
                    } else {
                        delay
                    };
                    PlannedChunk::new(c.to_string(), pause)
                })
                .collect()
        }
        StreamingMode::Word => {
            let delay = base_delay.mul_f64(2.5);
            text.split_whitespace()
                .enumerate()
                .map(|(i, word)| {
                    let piece = if i == 0 {
                        word.to_string()
                    } else {
                        format!(" {word}")
                    };
                    PlannedChunk::new(piece, delay)
                })
                .collect()
        }
        StreamingMode::Sentence => {
            let delay = base_delay.mul_f64(5.0);
            let mut chunks = Vec::new();
            let mut start = 0;
            for m in sentence_end().find_iter(text) {
                chunks.push(PlannedChunk::new(&text[start..m.end()], delay));
                start = m.end();
            }
            let rest = &text[start..];
            if !rest.trim().is_empty() {
                chunks.push(PlannedChunk::new(rest, Duration::ZERO));
            }
            chunks
        }
    }
}

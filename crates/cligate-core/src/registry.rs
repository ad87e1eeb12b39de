use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub session_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    info: StreamInfo,
    cancel: CancellationToken,
}

/// Live SSE conversions, keyed by a per-stream id. Entries are owned by
/// their [`StreamGuard`] and removed when it drops.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, session_id: &str, model: &str) -> StreamGuard {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let info = StreamInfo {
            stream_id: stream_id.clone(),
            session_id: session_id.to_string(),
            model: model.to_string(),
            started_at: Utc::now(),
        };
        self.lock().insert(
            stream_id.clone(),
            Entry {
                info,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(stream_id = %stream_id, session_id, "registered stream");
        StreamGuard {
            registry: self.clone(),
            stream_id,
            cancel,
            release: None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn active(&self) -> Vec<StreamInfo> {
        let mut streams = self.lock().values().map(|e| e.info.clone()).collect::<Vec<_>>();
        streams.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        streams
    }

    /// Cancels streams serving `session_id`; they end on their next pull.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let entries = self.lock();
        let mut cancelled = 0;
        for entry in entries.values().filter(|e| e.info.session_id == session_id) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancels every live stream. Entries stay until their guards drop.
    pub fn cleanup_all(&self) -> usize {
        let entries = self.lock();
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "cancelled active streams");
        }
        entries.len()
    }

    fn unregister(&self, stream_id: &str) {
        self.lock().remove(stream_id);
    }
}

/// Registration of one live stream. Dropping it unregisters the stream and
/// runs the release hook exactly once.
pub struct StreamGuard {
    registry: StreamRegistry,
    stream_id: String,
    cancel: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamGuard {
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.stream_id);
        if let Some(release) = self.release.take() {
            release();
        }
        tracing::debug!(stream_id = %self.stream_id, "stream released");
    }
}

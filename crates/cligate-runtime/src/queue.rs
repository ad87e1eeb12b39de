use std::time::Duration;

use cligate_types::CliEvent;
use serde::Serialize;
use tokio::sync::mpsc;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_TIMEOUTS: u32 = 3;

/// How a process left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExitOutcome {
    Completed,
    Failed { code: Option<i32> },
    Stopped,
}

/// Why an [`EventStream`] stopped yielding events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Closed(ExitOutcome),
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub poll_timeout: Duration,
    pub max_timeouts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
        }
    }
}

#[derive(Debug)]
enum QueueItem {
    Event(CliEvent),
    Close(ExitOutcome),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl EventSender {
    /// Returns false once the consumer side is gone.
    pub fn send(&self, event: CliEvent) -> bool {
        self.tx.send(QueueItem::Event(event)).is_ok()
    }

    pub fn close(&self, outcome: ExitOutcome) {
        let _ = self.tx.send(QueueItem::Close(outcome));
    }
}

/// Pull-based view over one process's output queue.
///
/// Each pull waits at most `poll_timeout`. The sequence ends at the close
/// marker, or after `max_timeouts` consecutive empty waits; [`end_reason`]
/// tells the two apart. Once ended it stays ended.
///
/// [`end_reason`]: EventStream::end_reason
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    policy: PollPolicy,
    consecutive_timeouts: u32,
    end: Option<StreamEnd>,
}

pub fn event_channel(policy: PollPolicy) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender { tx },
        EventStream {
            rx,
            policy,
            consecutive_timeouts: 0,
            end: None,
        },
    )
}

impl EventStream {
    pub async fn next(&mut self) -> Option<CliEvent> {
        if self.end.is_some() {
            return None;
        }
        loop {
            match tokio::time::timeout(self.policy.poll_timeout, self.rx.recv()).await {
                Ok(Some(QueueItem::Event(event))) => {
                    self.consecutive_timeouts = 0;
                    return Some(event);
                }
                Ok(Some(QueueItem::Close(outcome))) => {
                    self.end = Some(StreamEnd::Closed(outcome));
                    return None;
                }
                Ok(None) => {
                    // every sender dropped without a close marker
                    self.end = Some(StreamEnd::Closed(ExitOutcome::Stopped));
                    return None;
                }
                Err(_) => {
                    self.consecutive_timeouts += 1;
                    tracing::debug!(
                        timeouts = self.consecutive_timeouts,
                        limit = self.policy.max_timeouts,
                        "no process output within poll timeout"
                    );
                    if self.consecutive_timeouts >= self.policy.max_timeouts {
                        tracing::warn!(
                            timeouts = self.consecutive_timeouts,
                            "process output stalled; ending event stream"
                        );
                        self.end = Some(StreamEnd::TimedOut);
                        return None;
                    }
                }
            }
        }
    }

    pub fn end_reason(&self) -> Option<StreamEnd> {
        self.end
    }
}

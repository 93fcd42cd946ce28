//! Watch and notification types for reactive store updates.
//!
//! Every successful commit broadcasts a [`ChangeEvent`] carrying the changed
//! top-level fields and a snapshot of the new state. Subscribers filter by
//! field pattern; delivery is in-process only and never blocks the committing
//! caller.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::Stream;

use crate::value::StateMap;

/// How a commit changed the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A partial set: fields present in the patch were merged over the state.
    Merged,
    /// A full replacement of the state map.
    Replaced,
    /// A persisted snapshot was restored at startup.
    Hydrated,
}

/// An event representing one committed state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of commit that produced this event.
    pub kind: ChangeKind,
    /// Top-level fields whose values differ from the previous state.
    pub fields: Vec<String>,
    /// Snapshot of the state after the commit.
    pub state: StateMap,
    /// Commit counter after the change.
    pub revision: u64,
}

impl ChangeEvent {
    /// Whether the given top-level field changed in this commit.
    pub fn touches(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

/// A stream of change events filtered by a field pattern.
pub struct WatchStream {
    receiver: broadcast::Receiver<ChangeEvent>,
    pattern: String,
}

impl WatchStream {
    /// Create a new watch stream for the given pattern.
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>, pattern: impl Into<String>) -> Self {
        Self {
            receiver,
            pattern: pattern.into(),
        }
    }

    /// Get the pattern this stream is watching.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if an event matches this stream's pattern.
    ///
    /// `*` matches every event; a trailing `*` prefix-matches field names;
    /// anything else must equal a changed field exactly.
    fn matches(&self, event: &ChangeEvent) -> bool {
        if self.pattern == "*" {
            return true;
        }
        if let Some(prefix) = self.pattern.strip_suffix('*') {
            event.fields.iter().any(|f| f.starts_with(prefix))
        } else {
            event.touches(&self.pattern)
        }
    }
}

impl Stream for WatchStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Poll::Ready(Some(event));
                    }
                    // Event doesn't match pattern, continue polling
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    // Register waker and return pending
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Poll::Ready(None);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // Skip lagged events
                    continue;
                }
            }
        }
    }
}

/// Handle for broadcasting change events to subscribers.
#[derive(Clone)]
pub struct WatchSender {
    sender: broadcast::Sender<ChangeEvent>,
}

impl WatchSender {
    /// Create a new watch sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    pub fn send(&self, event: ChangeEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events matching a field pattern.
    pub fn subscribe(&self, pattern: impl Into<String>) -> WatchStream {
        WatchStream::new(self.sender.subscribe(), pattern)
    }

    /// Get the number of current subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WatchSender {
    fn default() -> Self {
        Self::new(1024)
    }
}

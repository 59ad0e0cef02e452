//! Status event stream for one orchestration.
//!
//! The coordinator publishes every state change here in the order it makes
//! them. Each subscriber gets its own unbounded queue, so a slow reader
//! never loses events and never holds up the coordinator. The stream is
//! closed after the final `orchestration_status` event; subscribing to a
//! closed stream yields a receiver that ends immediately.

use crate::core::{MergeConflict, Orchestration, SubagentTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

/// Event payload, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskUpdate {
        task: SubagentTask,
        message: String,
    },
    ConflictDetected {
        conflict: MergeConflict,
        message: String,
    },
    ConflictResolved {
        conflict: MergeConflict,
        message: String,
    },
    OrchestrationStatus {
        orchestration: Orchestration,
        message: String,
    },
}

impl EventKind {
    /// Wire name, also used as the SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::TaskUpdate { .. } => "task_update",
            EventKind::ConflictDetected { .. } => "conflict_detected",
            EventKind::ConflictResolved { .. } => "conflict_resolved",
            EventKind::OrchestrationStatus { .. } => "orchestration_status",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EventKind::TaskUpdate { message, .. }
            | EventKind::ConflictDetected { message, .. }
            | EventKind::ConflictResolved { message, .. }
            | EventKind::OrchestrationStatus { message, .. } => message,
        }
    }
}

/// One published event: `{type, sequence, emittedAt, task?, conflict?,
/// orchestration?, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationEvent {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl OrchestrationEvent {
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<OrchestrationEvent>;

#[derive(Default)]
struct PublisherState {
    next_sequence: u64,
    subscribers: Vec<mpsc::UnboundedSender<OrchestrationEvent>>,
    closed: bool,
}

/// Per-orchestration event bus.
#[derive(Default)]
pub struct EventPublisher {
    inner: Mutex<PublisherState>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a subscriber to future events.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Stamp and fan out an event. Returns `None` once the stream is closed.
    pub fn publish(&self, kind: EventKind) -> Option<OrchestrationEvent> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.next_sequence += 1;
        let event = OrchestrationEvent {
            sequence: inner.next_sequence,
            emitted_at: Utc::now(),
            kind,
        };
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        trace!(
            event_type = event.event_type(),
            sequence = event.sequence,
            subscribers = inner.subscribers.len(),
            "event published"
        );
        Some(event)
    }

    /// Close the stream. Subscribers drain what they have, then end.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

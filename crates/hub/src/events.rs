//! Live-update fan-out to dashboard subscribers, backed by a
//! `tokio::broadcast` channel. Delivery is at-most-once and best-effort: a
//! subscriber that lags past the channel capacity loses the oldest events
//! rather than stalling the publisher, and one dead subscriber never affects
//! the others.

use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A telemetry record was ingested.
    New,
    /// A single record was deleted.
    Deleted,
    /// The record store was emptied.
    DeletedAll,
}

impl EventKind {
    /// Name used in the SSE `event:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Deleted => "deleted",
            Self::DeletedAll => "deleted_all",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubEvent {
    pub kind: EventKind,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver to every current subscriber. Returns the number of receivers;
    /// with nobody listening the event is silently dropped.
    pub fn publish(&self, kind: EventKind, payload: Value) -> usize {
        self.sender
            .send(HubEvent { kind, payload })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

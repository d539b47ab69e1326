//! Session notifications for renderers and the CLI

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of [`SessionEvent`]s
///
/// Publishing never blocks the coordinator; a subscriber that falls more
/// than `capacity` events behind gets `Lagged` and skips ahead.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers saw the event
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

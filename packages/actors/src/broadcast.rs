//! Event fan-out over a tokio broadcast channel.

use queue_core::{JobEvent, QueueObserver};
use tokio::sync::broadcast;

/// Observer that republishes every event to broadcast subscribers.
///
/// Slow subscribers lag and lose events; the queue itself never waits.
#[derive(Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl QueueObserver for BroadcastObserver {
    fn on_event(&self, event: &JobEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event.clone());
    }
}

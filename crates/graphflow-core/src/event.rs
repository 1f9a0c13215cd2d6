use tokio::sync::broadcast;

use crate::types::GraphEvent;

/// Fan-out of graph lifecycle events to any number of observers.
///
/// Publishing never waits on subscribers. One that falls more than
/// `capacity` events behind gets `RecvError::Lagged` and skips ahead.
pub struct EventBus {
    tx: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        // broadcast::channel panics on zero.
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: GraphEvent) {
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.tx.subscribe()
    }
}

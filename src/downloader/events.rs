use tokio::sync::broadcast;
use tracing::trace;

use super::models::DownloadEvent;

const EVENT_CAPACITY: usize = 1024;

/// Fan-out of download events to any number of observers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DownloadEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event, returns the number of observers it reached
    pub fn publish(&self, event: DownloadEvent) -> usize {
        trace!(item_id = %event.item_id(), "Publishing download event");
        // No observers is fine
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }
}

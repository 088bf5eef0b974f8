//! Notifications about sync outcomes.

use tokio::sync::broadcast;
use tracing::debug;

use docmirror_common::CollectionId;
use docmirror_store::SyncAttemptRecord;

/// Event published by the scheduler after a run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A run finished and produced a record.
    Completed(SyncAttemptRecord),
    /// A healthy collection transitioned into the failed state.
    Failed {
        collection: CollectionId,
        error: String,
        consecutive_failures: u32,
    },
    /// A collection succeeded after one or more failed runs.
    Recovered {
        collection: CollectionId,
        previous_failures: u32,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::Completed(_) => "completed",
            SyncEvent::Failed { .. } => "failed",
            SyncEvent::Recovered { .. } => "recovered",
        }
    }

    pub fn collection(&self) -> &CollectionId {
        match self {
            SyncEvent::Completed(record) => &record.collection_id,
            SyncEvent::Failed { collection, .. } | SyncEvent::Recovered { collection, .. } => {
                collection
            }
        }
    }
}

/// Broadcast fan-out of [`SyncEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.sender.send(event) {
            debug!("Dropped {} event (no active receivers): {}", event_type, e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

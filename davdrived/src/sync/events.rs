use std::path::PathBuf;

use tokio::sync::broadcast;

use super::monitor::MonitorState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Plain-data notifications about what the engine did. Paths are local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ItemSynced { path: PathBuf, direction: Direction },
    ItemDeferred { path: PathBuf, reason: String },
    Conflict { path: PathBuf },
    ItemFailed { path: PathBuf, error: String },
    MonitorState(MonitorState),
    FullPassCompleted { mutations: usize, failures: usize },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

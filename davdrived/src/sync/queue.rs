use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use davdrive_core::ChangeEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedChange {
    /// Reconcile everything.
    FullPass,
    Event(ChangeEvent),
}

#[derive(Debug, Default)]
struct QueueShared {
    full_pass_pending: AtomicBool,
    dropped: AtomicU64,
}

/// Producer half of the bounded incoming queue. `offer` never waits: when the
/// queue is full the change is dropped and the next full pass catches it up.
#[derive(Debug, Clone)]
pub struct ChangeQueue {
    tx: mpsc::Sender<QueuedChange>,
    shared: Arc<QueueShared>,
}

#[derive(Debug)]
pub struct ChangeReceiver {
    rx: mpsc::Receiver<QueuedChange>,
    shared: Arc<QueueShared>,
}

impl ChangeQueue {
    pub fn bounded(capacity: usize) -> (ChangeQueue, ChangeReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(QueueShared::default());
        (
            ChangeQueue {
                tx,
                shared: Arc::clone(&shared),
            },
            ChangeReceiver { rx, shared },
        )
    }

    /// Returns whether the change was accepted.
    pub fn offer(&self, change: QueuedChange) -> bool {
        match self.tx.try_send(change) {
            Ok(()) => true,
            // A full pass is never lost: it is remembered and served next.
            Err(TrySendError::Full(QueuedChange::FullPass)) => {
                self.shared.full_pass_pending.store(true, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Full(QueuedChange::Event(event))) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(kind = event.kind.as_str(), path = %event.path, "queue full, dropping change");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl ChangeReceiver {
    pub async fn recv(&mut self) -> Option<QueuedChange> {
        if self.shared.full_pass_pending.swap(false, Ordering::SeqCst) {
            return Some(QueuedChange::FullPass);
        }
        self.rx.recv().await
    }
}

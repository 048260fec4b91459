use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use davdrive_core::{ChangeEvent, ChangeKind, ChangeSource};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::context::DriveContext;
use super::error::{SyncError, SyncOutcome};
use super::events::{EventBus, SyncEvent};
use super::queue::{ChangeQueue, ChangeReceiver, QueuedChange};

pub const DEFAULT_CRUD_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_SYNC_ID_QUEUE_CAPACITY: usize = 1;

/// How incoming notifications are pre-filtered before they are queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MonitorMode {
    /// Plain create/update/delete/move notifications; only scope is checked.
    #[default]
    Crud,
    /// Notifications are checked against the local placeholder tree.
    SyncId,
}

impl MonitorMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "crud" => Some(MonitorMode::Crud),
            "sync-id" | "syncid" | "sync_id" => Some(MonitorMode::SyncId),
            _ => None,
        }
    }

    /// The precise filter drops most notifications up front, so the sync-id
    /// monitor only needs room for the pending item.
    pub fn default_queue_capacity(self) -> usize {
        match self {
            MonitorMode::Crud => DEFAULT_CRUD_QUEUE_CAPACITY,
            MonitorMode::SyncId => DEFAULT_SYNC_ID_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[async_trait]
pub trait EventFilter: Send + Sync {
    async fn accepts(&self, event: &ChangeEvent) -> bool;
}

/// Receives queued changes, one at a time.
#[async_trait]
pub trait ChangeDispatcher: Send + Sync {
    async fn full_pass(&self) -> Result<(), SyncError>;

    async fn apply(&self, event: &ChangeEvent) -> Result<SyncOutcome, SyncError>;
}

pub struct ScopeFilter {
    ctx: Arc<DriveContext>,
}

impl ScopeFilter {
    pub fn new(ctx: Arc<DriveContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventFilter for ScopeFilter {
    async fn accepts(&self, event: &ChangeEvent) -> bool {
        let mapping = &self.ctx.mapping;
        mapping.is_in_scope(&event.path)
            || event
                .target
                .as_deref()
                .is_some_and(|target| mapping.is_in_scope(target))
    }
}

/// Drops notifications that cannot matter to the local tree: changes under
/// folders that are not materialised, and updates to items that do not
/// exist locally.
pub struct PlaceholderFilter {
    ctx: Arc<DriveContext>,
}

impl PlaceholderFilter {
    pub fn new(ctx: Arc<DriveContext>) -> Self {
        Self { ctx }
    }

    async fn item_exists(&self, remote: &str) -> bool {
        match self.ctx.mapping.to_local(remote) {
            Ok(path) => self.ctx.fs.exists(&path).await,
            Err(_) => false,
        }
    }

    /// Whether the local parent of `remote` exists and is materialised, or
    /// pinned when `pinned_counts`.
    async fn parent_accepts(&self, remote: &str, pinned_counts: bool) -> bool {
        let Ok(path) = self.ctx.mapping.to_local(remote) else {
            return false;
        };
        let Some(parent) = path.parent() else {
            return false;
        };
        if !self.ctx.fs.exists(parent).await {
            return false;
        }
        if parent == self.ctx.mapping.local_root() {
            return true;
        }
        self.parent_materialised(parent, pinned_counts).await
    }

    async fn parent_materialised(&self, parent: &Path, pinned_counts: bool) -> bool {
        match self.ctx.fs.attributes(parent).await {
            Ok(attributes) => !attributes.offline || (pinned_counts && attributes.pinned),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl EventFilter for PlaceholderFilter {
    async fn accepts(&self, event: &ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::Created => self.parent_accepts(&event.path, true).await,
            ChangeKind::Deleted => self.parent_accepts(&event.path, false).await,
            ChangeKind::Moved => {
                if self.item_exists(&event.path).await {
                    return true;
                }
                match event.target.as_deref() {
                    Some(target) => self.parent_accepts(target, true).await,
                    None => false,
                }
            }
            ChangeKind::Updated | ChangeKind::Locked | ChangeKind::Unlocked => {
                self.item_exists(&event.path).await
            }
        }
    }
}

pub fn filter_for(mode: MonitorMode, ctx: Arc<DriveContext>) -> Arc<dyn EventFilter> {
    match mode {
        MonitorMode::Crud => Arc::new(ScopeFilter::new(ctx)),
        MonitorMode::SyncId => Arc::new(PlaceholderFilter::new(ctx)),
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mode: MonitorMode,
    pub queue_capacity: usize,
    pub reconnect_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let mode = MonitorMode::default();
        Self {
            mode,
            queue_capacity: mode.default_queue_capacity(),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Keeps a change-feed connection open, reconnecting after failures, and
/// feeds filtered notifications to a single dispatch worker through the
/// bounded queue. Every (re)connect queues a full pass.
pub struct RemoteMonitor {
    source: Arc<dyn ChangeSource>,
    dispatcher: Arc<dyn ChangeDispatcher>,
    filter: Arc<dyn EventFilter>,
    config: MonitorConfig,
    state: watch::Sender<MonitorState>,
    events: EventBus,
}

impl RemoteMonitor {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        dispatcher: Arc<dyn ChangeDispatcher>,
        filter: Arc<dyn EventFilter>,
        config: MonitorConfig,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Disconnected);
        Self {
            source,
            dispatcher,
            filter,
            config,
            state,
            events,
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
        tracing::debug!(?state, "change monitor state");
        self.events.emit(SyncEvent::MonitorState(state));
    }

    /// Runs until `cancel` fires. Returns how many notifications were dropped
    /// because the queue was full.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let (queue, receiver) = ChangeQueue::bounded(self.config.queue_capacity);
        let worker = tokio::spawn(dispatch_loop(
            receiver,
            Arc::clone(&self.dispatcher),
            cancel.clone(),
        ));
        let reconnect = Backoff::fixed(self.config.reconnect_delay);

        while !cancel.is_cancelled() {
            self.set_state(MonitorState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = self.source.connect() => connected,
            };
            match connected {
                Ok(mut connection) => {
                    self.set_state(MonitorState::Connected);
                    tracing::info!("change feed connected");
                    queue.offer(QueuedChange::FullPass);
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => break,
                            next = connection.next_event() => next,
                        };
                        match next {
                            Ok(Some(event)) => {
                                if self.filter.accepts(&event).await {
                                    queue.offer(QueuedChange::Event(event));
                                } else {
                                    tracing::trace!(kind = event.kind.as_str(), path = %event.path, "filtered out");
                                }
                            }
                            Ok(None) => {
                                tracing::info!("change feed closed by the server");
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "change feed failed");
                                break;
                            }
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "cannot connect to the change feed"),
            }
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(MonitorState::Reconnecting);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(reconnect.delay(0)) => {}
            }
        }

        let dropped = queue.dropped();
        drop(queue);
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "dispatch worker stopped abnormally");
        }
        self.set_state(MonitorState::Disconnected);
        if dropped > 0 {
            tracing::info!(dropped, "notifications dropped while the queue was full");
        }
        dropped
    }
}

async fn dispatch_loop(
    mut receiver: ChangeReceiver,
    dispatcher: Arc<dyn ChangeDispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = receiver.recv() => change,
        };
        let Some(change) = change else {
            break;
        };
        match change {
            QueuedChange::FullPass => {
                if let Err(err) = dispatcher.full_pass().await {
                    tracing::warn!(error = %err, "full pass failed");
                }
            }
            QueuedChange::Event(event) => match dispatcher.apply(&event).await {
                Ok(outcome) => {
                    tracing::debug!(kind = event.kind.as_str(), path = %event.path, ?outcome, "applied remote change");
                }
                Err(err) => {
                    tracing::warn!(kind = event.kind.as_str(), path = %event.path, error = %err, "remote change failed");
                }
            },
        }
    }
}

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use davdrive_core::ChangeEvent;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::DriveContext;
use super::error::{SyncError, SyncOutcome};
use super::events::SyncEvent;
use super::full_sync::{FullSync, FullSyncReport};
use super::incoming::IncomingSync;
use super::local_watcher::{LocalEvent, RenamePairing};
use super::monitor::ChangeDispatcher;
use super::outgoing::OutgoingSync;

/// One drive's sync engine: the outgoing and incoming halves plus the full
/// pass, wired to the same context.
pub struct SyncEngine {
    ctx: Arc<DriveContext>,
    outgoing: OutgoingSync,
    incoming: IncomingSync,
    full: Arc<FullSync>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(ctx: Arc<DriveContext>, cancel: CancellationToken) -> Self {
        let outgoing = OutgoingSync::new(Arc::clone(&ctx));
        let incoming = IncomingSync::new(Arc::clone(&ctx));
        let full = Arc::new(FullSync::new(
            Arc::clone(&ctx),
            outgoing.clone(),
            incoming.clone(),
        ));
        Self {
            ctx,
            outgoing,
            incoming,
            full,
            cancel,
        }
    }

    pub fn context(&self) -> &Arc<DriveContext> {
        &self.ctx
    }

    pub fn outgoing(&self) -> &OutgoingSync {
        &self.outgoing
    }

    pub fn incoming(&self) -> &IncomingSync {
        &self.incoming
    }

    pub fn full_sync(&self) -> Arc<FullSync> {
        Arc::clone(&self.full)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub async fn full_pass(&self) -> Result<FullSyncReport, SyncError> {
        self.full.run(&self.cancel).await
    }

    pub async fn handle_local_event(&self, event: LocalEvent) {
        match event {
            LocalEvent::Changed { path } => self.local_changed(&path).await,
            LocalEvent::Removed { path } | LocalEvent::MovedAway { path, .. } => {
                self.outgoing.on_deleted(&path).await
            }
            LocalEvent::MovedIn { path, .. } => self.local_changed(&path).await,
            LocalEvent::Renamed { from, to } => {
                if let Err(err) = self.ctx.fs.track_rename(&from, &to).await {
                    tracing::warn!(from = %from.display(), to = %to.display(), error = %err, "cannot carry placeholder state");
                }
                match self.outgoing.move_to(&from, &to).await {
                    Ok(outcome) => tracing::debug!(path = %to.display(), ?outcome, "handled rename"),
                    Err(err) => self.ctx.report_failure(&to, "move", &err),
                }
            }
            LocalEvent::OpenedForWrite { path } => self.outgoing.on_opened_for_write(&path).await,
            LocalEvent::Closed { path } => self.outgoing.on_closed(&path).await,
        }
    }

    async fn local_changed(&self, path: &Path) {
        if !self.ctx.fs.exists(path).await {
            return;
        }
        let result = self.push_change(path).await;
        match result {
            Ok(outcome) => tracing::debug!(path = %path.display(), ?outcome, "handled local change"),
            Err(err) => self.ctx.report_failure(path, "upload", &err),
        }
    }

    async fn push_change(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let items = self.ctx.items();
        if items.is_new(path).await? {
            return self.outgoing.create(path).await;
        }
        if let Some(original) = items.original_path(path).await?
            && items.is_moved(path).await?
        {
            let from = self.ctx.mapping.local_for_relative(&original);
            return self.outgoing.move_to(&from, path).await;
        }
        self.outgoing.update(path).await
    }

    /// Feeds watcher events to the engine until the channel closes or the
    /// engine is cancelled. Events already queued are handled as one batch;
    /// rename halves are paired across batches.
    pub async fn run_local_events(&self, mut events: mpsc::UnboundedReceiver<LocalEvent>) {
        let mut renames = RenamePairing::new(self.ctx.config.rename_window);
        loop {
            let deadline = renames.next_deadline();
            let (batch, closed) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = wait_until(deadline) => (renames.expire(Instant::now()), false),
                event = events.recv() => match event {
                    Some(event) => {
                        let mut batch = vec![event];
                        while let Ok(event) = events.try_recv() {
                            batch.push(event);
                        }
                        (renames.push(batch, Instant::now()), false)
                    }
                    None => (renames.drain(), true),
                },
            };
            for event in batch {
                self.handle_local_event(event).await;
            }
            if closed {
                break;
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl ChangeDispatcher for SyncEngine {
    async fn full_pass(&self) -> Result<(), SyncError> {
        SyncEngine::full_pass(self).await.map(|_| ())
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<SyncOutcome, SyncError> {
        self.incoming.apply(event).await
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

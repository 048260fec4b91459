use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use davdrive_core::list_all_children;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::context::DriveContext;
use super::error::{SyncError, SyncOutcome};
use super::events::SyncEvent;
use super::filter::avoid_sync;
use super::incoming::IncomingSync;
use super::outgoing::OutgoingSync;

const LIST_PATTERN: &str = "*";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub moved: usize,
    pub uploaded: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub hydrated: usize,
    pub dehydrated: usize,
    pub failures: usize,
}

impl FullSyncReport {
    pub fn mutations(&self) -> usize {
        self.moved
            + self.uploaded
            + self.created
            + self.updated
            + self.deleted
            + self.hydrated
            + self.dehydrated
    }
}

/// Reconciles the whole tree: local moves first, then each folder's local
/// edits, its remote listing and its pin state. One pass runs at a time.
pub struct FullSync {
    ctx: Arc<DriveContext>,
    outgoing: OutgoingSync,
    incoming: IncomingSync,
    running: Mutex<()>,
}

impl FullSync {
    pub fn new(ctx: Arc<DriveContext>, outgoing: OutgoingSync, incoming: IncomingSync) -> Self {
        Self {
            ctx,
            outgoing,
            incoming,
            running: Mutex::new(()),
        }
    }

    /// Runs a pass, waiting for one already in progress to finish first.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<FullSyncReport, SyncError> {
        let _running = self.running.lock().await;
        self.pass(cancel).await
    }

    /// Runs a pass unless one is already in progress.
    pub async fn try_run(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<FullSyncReport, SyncError>> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("full pass already running");
            return None;
        };
        Some(self.pass(cancel).await)
    }

    pub async fn run_periodically(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.try_run(&cancel).await {
                    Some(Err(SyncError::Cancelled)) => break,
                    Some(Err(err)) => tracing::warn!(error = %err, "periodic full pass failed"),
                    Some(Ok(_)) | None => {}
                },
            }
        }
    }

    async fn pass(&self, cancel: &CancellationToken) -> Result<FullSyncReport, SyncError> {
        let mut report = FullSyncReport::default();
        let root = self.ctx.mapping.local_root().to_path_buf();
        tracing::info!(root = %root.display(), "full pass started");

        let held = self.push_moves(&root, &mut report, cancel).await?;

        let mut pending = vec![root];
        while let Some(folder) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.sync_folder(&folder, &held, &mut report).await;
            pending.extend(self.subfolders(&folder, &mut report).await);
        }

        tracing::info!(
            mutations = report.mutations(),
            failures = report.failures,
            "full pass finished"
        );
        self.ctx.events.emit(SyncEvent::FullPassCompleted {
            mutations: report.mutations(),
            failures: report.failures,
        });
        Ok(report)
    }

    /// Replays local moves before any folder is reconciled, so a moved item
    /// is not mistaken for a delete at its old location. Returns the old
    /// paths of moves that are still pending, such as conflicted ones.
    async fn push_moves(
        &self,
        root: &Path,
        report: &mut FullSyncReport,
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>, SyncError> {
        let items = self.ctx.items();
        let mut held = HashSet::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(folder) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            for child in self.local_children(&folder, report).await {
                let source = match items.move_source(&child).await {
                    Ok(source) => source,
                    Err(err) => {
                        self.failed(report, &child, "move", &err);
                        None
                    }
                };
                if let Some(original) = source {
                    match self.replay_move(&child, &original).await {
                        Ok(outcome) if outcome.is_mutation() => report.moved += 1,
                        Ok(_) => {}
                        Err(err) => self.failed(report, &child, "move", &err),
                    }
                    if matches!(items.is_moved(&child).await, Ok(true) | Err(_)) {
                        held.insert(namespace_key(&original));
                    }
                }
                if self.ctx.fs.is_folder(&child).await.unwrap_or(false) {
                    pending.push(child);
                }
            }
        }
        Ok(held)
    }

    /// A move refused as a conflict waits for take-local or take-remote.
    async fn replay_move(&self, path: &Path, original: &Path) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        if self.ctx.has_conflict(&relative).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        let from = self.ctx.mapping.local_for_relative(original);
        self.outgoing.move_to(&from, path).await
    }

    async fn sync_folder(
        &self,
        folder: &Path,
        held: &HashSet<String>,
        report: &mut FullSyncReport,
    ) {
        let ctx = &self.ctx;
        let items = ctx.items();

        for child in self.local_children(folder, report).await {
            let result = self.push_local(&child).await;
            if self.tally(report, &child, "upload", result) {
                report.uploaded += 1;
            }
        }

        let remote = match ctx.mapping.to_remote(folder) {
            Ok(remote) => remote,
            Err(err) => {
                self.failed(report, folder, "list", &SyncError::from(err));
                return;
            }
        };
        let listing = list_all_children(
            ctx.remote.as_ref(),
            &remote,
            LIST_PATTERN,
            ctx.config.page_size,
            |fetched, total| tracing::debug!(folder = %remote, fetched, total, "listing"),
        )
        .await;
        let remote_items = match listing {
            Ok(remote_items) => remote_items,
            Err(err) if err.is_not_found() => {
                tracing::debug!(folder = %remote, "folder is gone remotely");
                return;
            }
            Err(err) => {
                self.failed(report, folder, "list", &SyncError::from(err));
                return;
            }
        };

        let mut remote_names = HashSet::new();
        for item in &remote_items {
            remote_names.insert(item.name.to_lowercase());
            let path = folder.join(&item.name);
            if ctx.fs.exists(&path).await {
                let result = self.incoming.update_local(&path, item).await;
                if self.tally(report, &path, "download", result) {
                    report.updated += 1;
                }
            } else if self.held_by_move(&path, held) {
                tracing::debug!(path = %path.display(), "old path of a pending local move");
            } else {
                let result = self.incoming.create_local(&path, item).await;
                if self.tally(report, &path, "create", result) {
                    report.created += 1;
                }
            }
        }

        for child in self.local_children(folder, report).await {
            let name = child
                .file_name()
                .map(|name| name.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !remote_names.contains(&name) {
                // Unsynced or moved items are not remote deletions.
                let keep = match (items.is_new(&child).await, items.is_moved(&child).await) {
                    (Ok(new), Ok(moved)) => new || moved,
                    (Err(err), _) | (_, Err(err)) => {
                        self.failed(report, &child, "delete", &err);
                        true
                    }
                };
                if !keep {
                    let result = self.incoming.delete_local(&child).await;
                    if self.tally(report, &child, "delete", result) {
                        report.deleted += 1;
                    }
                }
                continue;
            }

            let result = self.incoming.hydrate(&child).await;
            if self.tally(report, &child, "hydrate", result) {
                report.hydrated += 1;
            }
            let result = self.incoming.dehydrate(&child).await;
            if self.tally(report, &child, "dehydrate", result) {
                report.dehydrated += 1;
            }
        }
    }

    /// New items are created, locally edited files uploaded. Conflicted and
    /// offline items are left alone.
    async fn push_local(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let items = self.ctx.items();
        if items.is_new(path).await? {
            return self.outgoing.create(path).await;
        }
        if !items.is_file(path).await? || items.is_offline(path).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        let relative = self.ctx.relative(path)?;
        if items.in_sync(path).await? || self.ctx.has_conflict(&relative).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        self.outgoing.update(path).await
    }

    fn held_by_move(&self, path: &Path, held: &HashSet<String>) -> bool {
        !held.is_empty()
            && self
                .ctx
                .mapping
                .relative(path)
                .is_ok_and(|relative| held.contains(&namespace_key(&relative)))
    }

    /// Local children that take part in sync.
    async fn local_children(&self, folder: &Path, report: &mut FullSyncReport) -> Vec<PathBuf> {
        let children = match self.ctx.fs.list_children(folder).await {
            Ok(children) => children,
            Err(err) => {
                self.failed(report, folder, "list", &SyncError::from(err));
                return Vec::new();
            }
        };
        let mut kept = Vec::with_capacity(children.len());
        for child in children {
            if !avoid_sync(self.ctx.fs.as_ref(), &child).await {
                kept.push(child);
            }
        }
        kept
    }

    async fn subfolders(&self, folder: &Path, report: &mut FullSyncReport) -> Vec<PathBuf> {
        let mut folders = Vec::new();
        for child in self.local_children(folder, report).await {
            if self.ctx.fs.is_folder(&child).await.unwrap_or(false) {
                folders.push(child);
            }
        }
        folders
    }

    /// Records the result of one item; returns whether it changed state.
    fn tally(
        &self,
        report: &mut FullSyncReport,
        path: &Path,
        op: &str,
        result: Result<SyncOutcome, SyncError>,
    ) -> bool {
        match result {
            Ok(outcome) => outcome.is_mutation(),
            Err(err) => {
                self.failed(report, path, op, &err);
                false
            }
        }
    }

    fn failed(&self, report: &mut FullSyncReport, path: &Path, op: &str, err: &SyncError) {
        report.failures += 1;
        self.ctx.report_failure(path, op, err);
    }
}

/// Namespace paths compare case-insensitively.
fn namespace_key(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/").to_lowercase()
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use davdrive_core::{ChangeEvent, ChangeKind, LockInfo, RemoteItem};

use super::conflict::{ConflictDecision, resolve_conflict};
use super::context::DriveContext;
use super::error::{SyncError, SyncOutcome};
use super::events::Direction;
use super::filter::avoid_sync;
use super::placeholder::PlaceholderInfo;
use super::side_store::{LockMode, lock_columns, lock_is_expired};

/// Applies remote changes to the local namespace. Remote paths outside the
/// mapped remote root are ignored.
#[derive(Clone)]
pub struct IncomingSync {
    ctx: Arc<DriveContext>,
}

impl IncomingSync {
    pub fn new(ctx: Arc<DriveContext>) -> Self {
        Self { ctx }
    }

    pub async fn apply(&self, event: &ChangeEvent) -> Result<SyncOutcome, SyncError> {
        match event.kind {
            ChangeKind::Created => self.created(&event.path).await,
            ChangeKind::Updated => self.updated(&event.path).await,
            ChangeKind::Deleted => self.deleted(&event.path).await,
            ChangeKind::Moved => match event.target.as_deref() {
                Some(target) => self.moved(&event.path, target).await,
                None => Ok(SyncOutcome::Skipped),
            },
            ChangeKind::Locked | ChangeKind::Unlocked => self.lock_changed(&event.path).await,
        }
    }

    /// Local path and namespace-relative path of a remote item, or `None`
    /// when it is out of scope (or the remote root itself).
    fn resolve(&self, remote: &str) -> Option<(PathBuf, PathBuf)> {
        let relative = self.ctx.mapping.relative_from_remote(remote).ok()?;
        if relative.as_os_str().is_empty() {
            return None;
        }
        Some((self.ctx.mapping.local_for_relative(&relative), relative))
    }

    async fn fetch_item(&self, remote: &str) -> Result<Option<RemoteItem>, SyncError> {
        let ctx = &self.ctx;
        match ctx.with_retry(|| ctx.remote.get_item(remote)).await {
            Ok(item) => Ok(Some(item)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether an item may be materialised under `path`'s parent.
    async fn parent_accepts(&self, path: &Path) -> Result<bool, SyncError> {
        let Some(parent) = path.parent() else {
            return Ok(false);
        };
        if !self.ctx.fs.exists(parent).await {
            return Ok(false);
        }
        if parent == self.ctx.mapping.local_root() {
            return Ok(true);
        }
        Ok(!self.ctx.items().is_offline(parent).await?)
    }

    pub async fn created(&self, remote: &str) -> Result<SyncOutcome, SyncError> {
        let Some((path, relative)) = self.resolve(remote) else {
            tracing::debug!(%remote, "ignoring create outside the remote root");
            return Ok(SyncOutcome::Skipped);
        };
        let _guard = self.ctx.locks.lock(&relative).await;
        let Some(item) = self.fetch_item(remote).await? else {
            return Ok(SyncOutcome::Skipped);
        };
        self.create_local_locked(&path, &relative, &item).await
    }

    pub(crate) async fn create_local(
        &self,
        path: &Path,
        item: &RemoteItem,
    ) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let _guard = self.ctx.locks.lock(&relative).await;
        self.create_local_locked(path, &relative, item).await
    }

    async fn create_local_locked(
        &self,
        path: &Path,
        relative: &Path,
        item: &RemoteItem,
    ) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        if ctx.fs.exists(path).await {
            return Ok(SyncOutcome::Unchanged);
        }
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(SyncOutcome::Skipped);
        };
        if !ctx.fs.exists(parent).await || avoid_sync(ctx.fs.as_ref(), path).await {
            return Ok(SyncOutcome::Skipped);
        }

        let info = PlaceholderInfo {
            name: name.to_string_lossy().into_owned(),
            is_folder: item.is_folder(),
            size: item.size.unwrap_or_default(),
        };
        let created = ctx.fs.create_placeholder(parent, &info).await?;
        ctx.record_version(relative, item.etag.as_deref()).await?;
        ctx.mark_synced(&created, relative).await?;
        self.apply_lock_state(&created, relative, item.lock.as_ref())
            .await?;

        let items = ctx.items();
        if items.is_pinned(parent).await? {
            let mut attributes = items.attributes(&created).await?;
            attributes.pinned = true;
            ctx.fs.set_attributes(&created, attributes).await?;
            if !item.is_folder() {
                self.hydrate_locked(&created, relative).await?;
            }
        }
        tracing::info!(path = %created.display(), kind = item.kind.as_str(), "created locally");
        ctx.notify_synced(&created, Direction::Incoming);
        Ok(SyncOutcome::Synced)
    }

    pub async fn updated(&self, remote: &str) -> Result<SyncOutcome, SyncError> {
        let Some((path, relative)) = self.resolve(remote) else {
            return Ok(SyncOutcome::Skipped);
        };
        let _guard = self.ctx.locks.lock(&relative).await;
        if !self.ctx.fs.exists(&path).await {
            if !self.parent_accepts(&path).await? {
                return Ok(SyncOutcome::Skipped);
            }
            return match self.fetch_item(remote).await? {
                Some(item) => self.create_local_locked(&path, &relative, &item).await,
                None => Ok(SyncOutcome::Skipped),
            };
        }
        // Gone again: the delete notification will follow.
        let Some(item) = self.fetch_item(remote).await? else {
            return Ok(SyncOutcome::Skipped);
        };
        self.update_local_locked(&path, &relative, &item).await
    }

    pub(crate) async fn update_local(
        &self,
        path: &Path,
        item: &RemoteItem,
    ) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let _guard = self.ctx.locks.lock(&relative).await;
        if !self.ctx.fs.exists(path).await {
            return Ok(SyncOutcome::Skipped);
        }
        self.update_local_locked(path, &relative, item).await
    }

    async fn update_local_locked(
        &self,
        path: &Path,
        relative: &Path,
        item: &RemoteItem,
    ) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        let items = ctx.items();
        let is_folder = ctx.fs.is_folder(path).await?;
        if items.is_new(path).await? {
            if is_folder && item.is_folder() {
                // Same folder created on both sides.
                ctx.fs.convert_to_placeholder(path).await?;
                ctx.record_version(relative, item.etag.as_deref()).await?;
                ctx.mark_synced(path, relative).await?;
                return Ok(SyncOutcome::Synced);
            }
            ctx.mark_conflict(path, relative).await?;
            return Err(SyncError::Conflict(path.to_path_buf()));
        }

        let offline = items.is_offline(path).await?;
        let local_modified = !is_folder && !offline && !items.in_sync(path).await?;
        let base = ctx.side_store.get_etag(relative).await?;
        match resolve_conflict(base.as_deref(), local_modified, item.etag.as_deref()) {
            ConflictDecision::NoOp => {
                let changed = self
                    .apply_lock_state(path, relative, item.lock.as_ref())
                    .await?;
                Ok(if changed {
                    SyncOutcome::Synced
                } else {
                    SyncOutcome::Unchanged
                })
            }
            // The outgoing side owns this one.
            ConflictDecision::UploadLocal => Ok(SyncOutcome::Unchanged),
            ConflictDecision::Conflict => {
                ctx.mark_conflict(path, relative).await?;
                Err(SyncError::Conflict(path.to_path_buf()))
            }
            ConflictDecision::DownloadRemote => {
                if !is_folder && !offline {
                    let content = self.download(relative).await?;
                    ctx.fs.write_content(path, &content).await?;
                }
                ctx.record_version(relative, item.etag.as_deref()).await?;
                ctx.mark_synced(path, relative).await?;
                self.apply_lock_state(path, relative, item.lock.as_ref())
                    .await?;
                tracing::info!(path = %path.display(), offline, "updated locally");
                ctx.notify_synced(path, Direction::Incoming);
                Ok(SyncOutcome::Synced)
            }
        }
    }

    async fn download(&self, relative: &Path) -> Result<Vec<u8>, SyncError> {
        let ctx = &self.ctx;
        let remote = ctx.mapping.remote_for_relative(relative)?;
        Ok(ctx
            .with_retry(|| ctx.remote.read_range(&remote, 0, None))
            .await?)
    }

    pub async fn deleted(&self, remote: &str) -> Result<SyncOutcome, SyncError> {
        let Some((path, relative)) = self.resolve(remote) else {
            return Ok(SyncOutcome::Skipped);
        };
        let _guard = self.ctx.locks.lock(&relative).await;
        self.delete_local_locked(&path, &relative).await
    }

    pub(crate) async fn delete_local(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let _guard = self.ctx.locks.lock(&relative).await;
        self.delete_local_locked(path, &relative).await
    }

    async fn delete_local_locked(
        &self,
        path: &Path,
        relative: &Path,
    ) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        if !ctx.fs.exists(path).await {
            ctx.side_store.delete(relative).await?;
            return Ok(SyncOutcome::Skipped);
        }
        if self.has_local_changes(path).await? {
            ctx.mark_conflict(path, relative).await?;
            return Err(SyncError::Conflict(path.to_path_buf()));
        }
        ctx.fs.delete_item(path).await?;
        ctx.side_store.delete(relative).await?;
        tracing::info!(path = %path.display(), "deleted locally");
        ctx.notify_synced(path, Direction::Incoming);
        Ok(SyncOutcome::Synced)
    }

    /// True when the item, or anything below it, holds changes that were
    /// never uploaded.
    async fn has_local_changes(&self, path: &Path) -> Result<bool, SyncError> {
        let ctx = &self.ctx;
        let items = ctx.items();
        let mut pending = vec![path.to_path_buf()];
        while let Some(item) = pending.pop() {
            if avoid_sync(ctx.fs.as_ref(), &item).await {
                continue;
            }
            if items.is_new(&item).await? {
                return Ok(true);
            }
            if ctx.fs.is_folder(&item).await? {
                pending.extend(ctx.fs.list_children(&item).await?);
            } else if !items.in_sync(&item).await? && !items.is_offline(&item).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn moved(&self, from: &str, to: &str) -> Result<SyncOutcome, SyncError> {
        match (self.resolve(from), self.resolve(to)) {
            (None, None) => Ok(SyncOutcome::Skipped),
            (None, Some(_)) => self.created(to).await,
            (Some(_), None) => self.deleted(from).await,
            (Some((from_path, from_relative)), Some((to_path, to_relative))) => {
                let _guards = self
                    .ctx
                    .locks
                    .lock_pair(&from_relative, &to_relative)
                    .await;
                self.moved_locked(&from_path, &from_relative, &to_path, &to_relative, to)
                    .await
            }
        }
    }

    async fn moved_locked(
        &self,
        from: &Path,
        from_relative: &Path,
        to: &Path,
        to_relative: &Path,
        remote_target: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        if ctx.fs.exists(to).await {
            // Already in place, usually the echo of a local move.
            return Ok(SyncOutcome::Unchanged);
        }

        if !ctx.fs.exists(from).await {
            if !self.parent_accepts(to).await? {
                ctx.side_store.delete(from_relative).await?;
                return Ok(SyncOutcome::Skipped);
            }
            return match self.fetch_item(remote_target).await? {
                Some(item) => self.create_local_locked(to, to_relative, &item).await,
                None => Ok(SyncOutcome::Skipped),
            };
        }

        let parent_exists = match to.parent() {
            Some(parent) => ctx.fs.exists(parent).await,
            None => false,
        };
        if !parent_exists {
            // Moved somewhere this client does not materialise.
            return self.delete_local_locked(from, from_relative).await;
        }
        ctx.fs.move_item(from, to).await?;
        ctx.side_store.move_to(from_relative, to_relative).await?;
        ctx.items().set_original_path(to, Some(to_relative)).await?;
        if ctx.fs.is_folder(to).await? {
            ctx.rebase_markers(to).await?;
        }
        tracing::info!(from = %from.display(), to = %to.display(), "moved locally");
        ctx.notify_synced(to, Direction::Incoming);
        Ok(SyncOutcome::Synced)
    }

    pub async fn lock_changed(&self, remote: &str) -> Result<SyncOutcome, SyncError> {
        let Some((path, relative)) = self.resolve(remote) else {
            return Ok(SyncOutcome::Skipped);
        };
        let _guard = self.ctx.locks.lock(&relative).await;
        if !self.ctx.fs.exists(&path).await {
            return Ok(SyncOutcome::Skipped);
        }
        let Some(item) = self.fetch_item(remote).await? else {
            return Ok(SyncOutcome::Skipped);
        };
        let changed = self
            .apply_lock_state(&path, &relative, item.lock.as_ref())
            .await?;
        Ok(if changed {
            SyncOutcome::Synced
        } else {
            SyncOutcome::Unchanged
        })
    }

    /// Brings the stored lock record, lock columns and read-only attribute in
    /// line with the remote lock. Returns whether anything changed.
    async fn apply_lock_state(
        &self,
        path: &Path,
        relative: &Path,
        lock: Option<&LockInfo>,
    ) -> Result<bool, SyncError> {
        let ctx = &self.ctx;
        let items = ctx.items();
        let manage_read_only = ctx.config.set_lock_read_only && items.is_file(path).await?;
        let stored = ctx.side_store.get_lock_info(relative).await?;

        let Some(lock) = lock.filter(|lock| !lock_is_expired(lock)) else {
            let mut changed = false;
            if stored.is_some() {
                ctx.side_store.clear_lock(relative).await?;
                changed = true;
            }
            if manage_read_only {
                changed |= items.set_read_only(path, false).await?;
            }
            return Ok(changed);
        };

        let held = ctx.side_store.get_lock_mode(relative).await? != LockMode::None;
        let held_same = held
            && stored.as_ref().is_some_and(|stored| {
                if lock.token.is_empty() {
                    stored.owner == lock.owner
                } else {
                    stored.token == lock.token
                }
            });
        let ours = held_same || ctx.owns_lock(lock);

        let mut record = lock.clone();
        if ours
            && record.token.is_empty()
            && let Some(stored) = &stored
        {
            record.token = stored.token.clone();
        }

        let mut changed = false;
        if held && !ours {
            ctx.side_store
                .set_lock_mode(relative, LockMode::None)
                .await?;
            changed = true;
        }
        if stored.as_ref() != Some(&record) {
            ctx.side_store.set_lock_info(relative, Some(&record)).await?;
            ctx.side_store
                .set_columns(relative, &lock_columns(&record))
                .await?;
            changed = true;
        }
        if manage_read_only {
            changed |= items
                .set_read_only(path, !ours && record.exclusive)
                .await?;
        }
        Ok(changed)
    }

    /// Fills an offline placeholder with the remote content.
    pub(crate) async fn hydrate(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let _guard = self.ctx.locks.lock(&relative).await;
        if !self.ctx.items().hydration_required(path).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        self.hydrate_locked(path, &relative).await?;
        tracing::debug!(path = %path.display(), "hydrated");
        Ok(SyncOutcome::Synced)
    }

    async fn hydrate_locked(&self, path: &Path, relative: &Path) -> Result<(), SyncError> {
        let content = self.download(relative).await?;
        self.ctx.fs.write_content(path, &content).await?;
        Ok(())
    }

    pub(crate) async fn dehydrate(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let _guard = self.ctx.locks.lock(&relative).await;
        let items = self.ctx.items();
        if !items.dehydration_required(path).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        // Unsynced edits would be lost.
        if !items.in_sync(path).await? {
            return Ok(SyncOutcome::Deferred);
        }
        self.ctx.fs.dehydrate(path).await?;
        tracing::debug!(path = %path.display(), "dehydrated");
        Ok(SyncOutcome::Synced)
    }

    /// Resolves a conflict in favour of the remote copy.
    pub async fn take_remote(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        let relative = ctx.relative(path)?;
        let Some(original) = ctx.items().move_source(path).await? else {
            let _guard = ctx.locks.lock(&relative).await;
            return self.take_remote_locked(path, &relative).await;
        };

        // The remote copy still sits at the old path: undo the local move.
        let _guards = ctx.locks.lock_pair(&original, &relative).await;
        let home = ctx.mapping.local_for_relative(&original);
        if ctx.fs.exists(&home).await {
            return Err(SyncError::Exists(home));
        }
        let remote = ctx.mapping.remote_for_relative(&original)?;
        ctx.with_retry(|| ctx.remote.get_item(&remote)).await?;
        ctx.fs.move_item(path, &home).await?;
        ctx.side_store.delete(&relative).await?;
        tracing::info!(from = %path.display(), path = %home.display(), "local move undone");
        self.take_remote_locked(&home, &original).await
    }

    async fn take_remote_locked(
        &self,
        path: &Path,
        relative: &Path,
    ) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        let remote = ctx.mapping.remote_for_relative(relative)?;
        let item = ctx.with_retry(|| ctx.remote.get_item(&remote)).await?;
        if !item.is_folder() && !ctx.items().is_offline(path).await? {
            let content = self.download(relative).await?;
            ctx.fs.write_content(path, &content).await?;
        }
        ctx.record_version(relative, item.etag.as_deref()).await?;
        ctx.mark_synced(path, relative).await?;
        self.apply_lock_state(path, relative, item.lock.as_ref())
            .await?;
        tracing::info!(path = %path.display(), "conflict resolved with the remote copy");
        ctx.notify_synced(path, Direction::Incoming);
        Ok(SyncOutcome::Synced)
    }
}

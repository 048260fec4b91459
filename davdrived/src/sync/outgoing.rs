use std::path::Path;
use std::sync::Arc;

use davdrive_core::{ItemKind, LockInfo, LockScope};

use super::conflict::ANY_VERSION;
use super::context::DriveContext;
use super::error::{SyncError, SyncOutcome};
use super::events::Direction;
use super::filter::{avoid_auto_lock, avoid_sync};
use super::mapping::{PathError, paths_equal, to_slash};
use super::side_store::{LockMode, lock_columns};

/// Pushes local changes to the remote store. Every operation takes the path
/// lock of the item it touches.
#[derive(Clone)]
pub struct OutgoingSync {
    ctx: Arc<DriveContext>,
}

impl OutgoingSync {
    pub fn new(ctx: Arc<DriveContext>) -> Self {
        Self { ctx }
    }

    /// Creates a never-synced item remotely. A new folder brings its new
    /// descendants along.
    pub async fn create(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let outcome = {
            let _guard = self.ctx.locks.lock(&relative).await;
            self.create_locked(path, &relative).await?
        };
        if outcome == SyncOutcome::Synced && self.ctx.fs.is_folder(path).await? {
            self.create_descendants(path).await;
        }
        Ok(outcome)
    }

    async fn create_descendants(&self, folder: &Path) {
        let mut pending = vec![folder.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let children = match self.ctx.fs.list_children(&dir).await {
                Ok(children) => children,
                Err(err) => {
                    self.ctx.report_failure(&dir, "list", &SyncError::from(err));
                    continue;
                }
            };
            for child in children {
                let result: Result<SyncOutcome, SyncError> = async {
                    let relative = self.ctx.relative(&child)?;
                    let _guard = self.ctx.locks.lock(&relative).await;
                    self.create_locked(&child, &relative).await
                }
                .await;
                match result {
                    Ok(SyncOutcome::Synced) => {
                        if self.ctx.fs.is_folder(&child).await.unwrap_or(false) {
                            pending.push(child);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => self.ctx.report_failure(&child, "create", &err),
                }
            }
        }
    }

    async fn create_locked(&self, path: &Path, relative: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        if !ctx.fs.exists(path).await || avoid_sync(ctx.fs.as_ref(), path).await {
            return Ok(SyncOutcome::Skipped);
        }
        if !ctx.items().is_new(path).await? {
            return Ok(SyncOutcome::Unchanged);
        }

        let parent = ctx
            .mapping
            .remote_for_relative(relative.parent().unwrap_or(Path::new("")))?;
        let name = item_name(relative)?;
        let (kind, content) = if ctx.fs.is_folder(path).await? {
            (ItemKind::Folder, None)
        } else {
            (ItemKind::File, Some(ctx.fs.read_content(path).await?))
        };

        let created = ctx
            .with_retry(|| ctx.remote.create(&parent, name, kind, content.clone()))
            .await;
        let item = match created {
            Ok(item) => item,
            Err(err) if err.is_conflict() => {
                tracing::warn!(path = %path.display(), "remote item already exists");
                return Err(SyncError::Exists(path.to_path_buf()));
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(path = %path.display(), "remote parent is gone; skipping create");
                return Ok(SyncOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };

        ctx.fs.convert_to_placeholder(path).await?;
        ctx.record_version(relative, item.etag.as_deref()).await?;
        ctx.mark_synced(path, relative).await?;
        tracing::info!(path = %path.display(), kind = kind.as_str(), "created remotely");
        ctx.notify_synced(path, Direction::Outgoing);
        Ok(SyncOutcome::Synced)
    }

    /// Uploads local content if it changed since the last sync, guarded by
    /// the recorded ETag.
    pub async fn update(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let relative = self.ctx.relative(path)?;
        let _guard = self.ctx.locks.lock(&relative).await;
        self.update_locked(path, &relative).await
    }

    async fn update_locked(&self, path: &Path, relative: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        if !ctx.fs.exists(path).await || avoid_sync(ctx.fs.as_ref(), path).await {
            return Ok(SyncOutcome::Skipped);
        }
        let items = ctx.items();
        if items.is_new(path).await? {
            return self.create_locked(path, relative).await;
        }
        if ctx.fs.is_folder(path).await? || items.is_offline(path).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        if items.in_sync(path).await? {
            return Ok(SyncOutcome::Unchanged);
        }
        if ctx.has_conflict(relative).await? {
            return Err(SyncError::Conflict(path.to_path_buf()));
        }

        let content = match ctx.fs.read_content(path).await {
            Ok(content) => content,
            Err(err) => {
                let err = SyncError::from(err);
                if err.is_transient() {
                    ctx.notify_deferred(path, err.to_string());
                    return Ok(SyncOutcome::Deferred);
                }
                return Err(err);
            }
        };
        let etag = ctx.side_store.get_etag(relative).await?;
        let expected = etag.as_deref().filter(|etag| *etag != ANY_VERSION);
        let token = ctx.held_lock(relative).await?.map(|lock| lock.token);
        let remote = ctx.mapping.remote_for_relative(relative)?;

        let written = ctx
            .with_retry(|| {
                ctx.remote
                    .write(&remote, content.clone(), expected, token.as_deref())
            })
            .await;
        let etag = match written {
            Ok(etag) => etag,
            Err(err) if err.is_conflict() => {
                ctx.mark_conflict(path, relative).await?;
                return Err(SyncError::Conflict(path.to_path_buf()));
            }
            Err(err) if err.is_locked() || err.is_retryable() => {
                ctx.notify_deferred(path, err.to_string());
                return Ok(SyncOutcome::Deferred);
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(path = %path.display(), "remote item is gone; skipping upload");
                return Ok(SyncOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };
        let etag = match etag {
            Some(etag) => Some(etag),
            None => ctx.remote.get_item(&remote).await?.etag,
        };

        ctx.record_version(relative, etag.as_deref()).await?;
        ctx.mark_synced(path, relative).await?;
        tracing::info!(path = %path.display(), "uploaded");
        ctx.notify_synced(path, Direction::Outgoing);
        Ok(SyncOutcome::Synced)
    }

    /// Moves the remote item to follow a local move or rename. The source is
    /// taken from the item's original-path marker; `from` is only the path
    /// reported by the watcher.
    pub async fn move_to(&self, from: &Path, to: &Path) -> Result<SyncOutcome, SyncError> {
        let from_relative = self.ctx.relative(from)?;
        let to_relative = self.ctx.relative(to)?;
        let _guards = self
            .ctx
            .locks
            .lock_pair(&from_relative, &to_relative)
            .await;
        self.move_locked(to, &to_relative).await
    }

    async fn move_locked(&self, to: &Path, to_relative: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        if !ctx.fs.exists(to).await || avoid_sync(ctx.fs.as_ref(), to).await {
            return Ok(SyncOutcome::Skipped);
        }
        let items = ctx.items();
        let Some(original) = items.original_path(to).await? else {
            // Never synced under its old name, e.g. an editor's temp file
            // renamed over a document. That is a save of the target.
            return self.update_locked(to, to_relative).await;
        };
        if paths_equal(&to_slash(&original)?, &to_slash(to_relative)?) {
            return Ok(SyncOutcome::Unchanged);
        }
        if !items.in_sync(to).await? {
            if !self.remote_exists(&original).await? {
                return self.recreate_moved(to, to_relative, &original).await;
            }
            tracing::warn!(path = %to.display(), "refusing to move an item with unsynced changes");
            ctx.mark_conflict(to, to_relative).await?;
            return Err(SyncError::Conflict(to.to_path_buf()));
        }

        if !self.move_remote(&original, to_relative).await? {
            return self.recreate_moved(to, to_relative, &original).await;
        }
        ctx.mark_synced(to, to_relative).await?;
        if ctx.fs.is_folder(to).await? {
            ctx.rebase_markers(to).await?;
        }
        tracing::info!(from = %original.display(), path = %to.display(), "moved remotely");
        ctx.notify_synced(to, Direction::Outgoing);
        Ok(SyncOutcome::Synced)
    }

    async fn remote_exists(&self, relative: &Path) -> Result<bool, SyncError> {
        let ctx = &self.ctx;
        let remote = ctx.mapping.remote_for_relative(relative)?;
        match ctx.with_retry(|| ctx.remote.get_item(&remote)).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Moves the remote item from `original` and its side-store records along
    /// with it. Returns `false` when the source is gone remotely.
    async fn move_remote(&self, original: &Path, to_relative: &Path) -> Result<bool, SyncError> {
        let ctx = &self.ctx;
        let source = ctx.mapping.remote_for_relative(original)?;
        let parent = ctx
            .mapping
            .remote_for_relative(to_relative.parent().unwrap_or(Path::new("")))?;
        let name = item_name(to_relative)?;
        match ctx
            .with_retry(|| ctx.remote.move_item(&source, &parent, name))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        ctx.side_store.move_to(original, to_relative).await?;
        Ok(true)
    }

    /// Nothing is left to move remotely: the item is uploaded as new under
    /// its current path.
    async fn recreate_moved(
        &self,
        to: &Path,
        to_relative: &Path,
        original: &Path,
    ) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        tracing::info!(from = %original.display(), path = %to.display(), "move source is gone remotely; creating instead");
        ctx.side_store.delete(original).await?;
        ctx.side_store.delete(to_relative).await?;
        ctx.items().set_original_path(to, None).await?;
        self.create_locked(to, to_relative).await
    }

    /// Deletes the remote counterpart of a locally deleted item. Side-store
    /// records are purged even when the remote call fails.
    pub async fn delete(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        let relative = ctx.relative(path)?;
        let _guard = ctx.locks.lock(&relative).await;
        if ctx.fs.exists(path).await {
            tracing::debug!(path = %path.display(), "recreated before the delete was handled");
            return Ok(SyncOutcome::Skipped);
        }
        if avoid_sync(ctx.fs.as_ref(), path).await {
            return Ok(SyncOutcome::Skipped);
        }

        let result = if ctx.side_store.get_etag(&relative).await?.is_none() {
            Ok(())
        } else {
            let remote = ctx.mapping.remote_for_relative(&relative)?;
            match ctx.with_retry(|| ctx.remote.delete(&remote)).await {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            }
        };
        ctx.side_store.delete(&relative).await?;
        result?;
        tracing::info!(path = %path.display(), "deleted remotely");
        ctx.notify_synced(path, Direction::Outgoing);
        Ok(SyncOutcome::Synced)
    }

    pub async fn on_deleted(&self, path: &Path) {
        if let Err(err) = self.delete(path).await {
            self.ctx.report_failure(path, "delete", &err);
        }
    }

    /// A file handle was closed: upload, then drop a lock taken on open.
    pub async fn on_closed(&self, path: &Path) {
        match self.update(path).await {
            Ok(outcome) => tracing::debug!(path = %path.display(), ?outcome, "handled close"),
            Err(err) => self.ctx.report_failure(path, "update", &err),
        }
        let Ok(relative) = self.ctx.relative(path) else {
            return;
        };
        match self.ctx.side_store.get_lock_mode(&relative).await {
            Ok(LockMode::Auto) => {
                if let Err(err) = self.unlock(path).await {
                    self.ctx.report_failure(path, "unlock", &err);
                }
            }
            Ok(_) => {}
            Err(err) => self.ctx.report_failure(path, "unlock", &SyncError::from(err)),
        }
    }

    pub async fn on_opened_for_write(&self, path: &Path) {
        let ctx = &self.ctx;
        if !ctx.config.auto_lock || avoid_auto_lock(ctx.fs.as_ref(), path).await {
            return;
        }
        match ctx.items().is_new(path).await {
            Ok(false) => {}
            Ok(true) => return,
            Err(err) => {
                ctx.report_failure(path, "lock", &err);
                return;
            }
        }
        match self.lock(path, LockMode::Auto).await {
            Ok(lock) => tracing::debug!(path = %path.display(), owner = %lock.owner, "auto-locked"),
            Err(err) => ctx.report_failure(path, "lock", &err),
        }
    }

    /// Takes an exclusive remote lock. A lock this client already holds is
    /// returned as is.
    pub async fn lock(&self, path: &Path, mode: LockMode) -> Result<LockInfo, SyncError> {
        let ctx = &self.ctx;
        let relative = ctx.relative(path)?;
        let _guard = ctx.locks.lock(&relative).await;
        if let Some(held) = ctx.held_lock(&relative).await? {
            return Ok(held);
        }

        let remote = ctx.mapping.remote_for_relative(&relative)?;
        let timeout = ctx.config.lock_timeout;
        let lock = match ctx
            .with_retry(|| ctx.remote.lock(&remote, LockScope::Exclusive, timeout))
            .await
        {
            Ok(lock) => lock,
            Err(err) if err.is_locked() => {
                let owner = ctx
                    .remote
                    .get_item(&remote)
                    .await
                    .ok()
                    .and_then(|item| item.lock)
                    .map(|lock| lock.owner)
                    .unwrap_or_else(|| "another user".to_string());
                return Err(SyncError::LockedByAnother {
                    path: path.to_path_buf(),
                    owner,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let mode = if mode == LockMode::None {
            LockMode::Manual
        } else {
            mode
        };
        ctx.side_store.set_lock_info(&relative, Some(&lock)).await?;
        ctx.side_store.set_lock_mode(&relative, mode).await?;
        ctx.side_store
            .set_columns(&relative, &lock_columns(&lock))
            .await?;
        tracing::info!(path = %path.display(), ?mode, "locked");
        Ok(lock)
    }

    pub async fn unlock(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        let relative = ctx.relative(path)?;
        let _guard = ctx.locks.lock(&relative).await;
        let Some(lock) = ctx.side_store.get_lock_info(&relative).await? else {
            return Ok(SyncOutcome::Unchanged);
        };
        let mode = ctx.side_store.get_lock_mode(&relative).await?;
        if mode == LockMode::None && !ctx.owns_lock(&lock) {
            return Err(SyncError::LockedByAnother {
                path: path.to_path_buf(),
                owner: lock.owner,
            });
        }

        let remote = ctx.mapping.remote_for_relative(&relative)?;
        match ctx
            .with_retry(|| ctx.remote.unlock(&remote, &lock.token))
            .await
        {
            Ok(()) => {}
            // Already expired or released on the server.
            Err(err) if err.is_not_found() || err.is_conflict() => {}
            Err(err) => return Err(err.into()),
        }
        ctx.side_store.clear_lock(&relative).await?;
        tracing::info!(path = %path.display(), "unlocked");
        Ok(SyncOutcome::Synced)
    }

    /// Resolves a conflict in favour of the local copy by overwriting the
    /// remote item unconditionally. A local move is replayed remotely first.
    pub async fn take_local(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let ctx = &self.ctx;
        let relative = ctx.relative(path)?;
        let source = ctx.items().move_source(path).await?;
        let _guards = ctx
            .locks
            .lock_pair(source.as_deref().unwrap_or(relative.as_path()), &relative)
            .await;
        if let Some(original) = &source
            && !self.move_remote(original, &relative).await?
        {
            return self.recreate_moved(path, &relative, original).await;
        }
        if ctx.fs.is_folder(path).await? {
            ctx.mark_synced(path, &relative).await?;
            if source.is_some() {
                ctx.rebase_markers(path).await?;
            }
            return Ok(SyncOutcome::Synced);
        }

        let content = ctx.fs.read_content(path).await?;
        let token = ctx.held_lock(&relative).await?.map(|lock| lock.token);
        let remote = ctx.mapping.remote_for_relative(&relative)?;
        let etag = ctx
            .with_retry(|| ctx.remote.write(&remote, content.clone(), None, token.as_deref()))
            .await?;
        let etag = match etag {
            Some(etag) => Some(etag),
            None => ctx.remote.get_item(&remote).await?.etag,
        };

        ctx.record_version(&relative, etag.as_deref()).await?;
        ctx.mark_synced(path, &relative).await?;
        tracing::info!(path = %path.display(), "conflict resolved with the local copy");
        ctx.notify_synced(path, Direction::Outgoing);
        Ok(SyncOutcome::Synced)
    }
}

fn item_name(relative: &Path) -> Result<&str, PathError> {
    relative
        .file_name()
        .ok_or(PathError::Root)?
        .to_str()
        .ok_or(PathError::NonUtf8)
}

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use davdrive_core::{DavError, LockInfo, RemoteStore};

use super::backoff::{Backoff, retry};
use super::conflict::version_or_any;
use super::error::SyncError;
use super::events::{Direction, EventBus, SyncEvent};
use super::local_item::LocalItemState;
use super::locks::PathLocks;
use super::mapping::{Mapping, PathError};
use super::placeholder::PlaceholderFs;
use super::side_store::{LockMode, SideStore, column_ids, conflict_column, etag_column};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lock owner name of this client; locks held by anyone else are foreign.
    pub current_user: Option<String>,
    pub retry_attempts: u32,
    pub retry_backoff: Backoff,
    /// Lock documents when they are opened for writing.
    pub auto_lock: bool,
    /// Mark files read-only while another principal holds an exclusive lock.
    pub set_lock_read_only: bool,
    pub lock_timeout: Duration,
    pub page_size: u32,
    /// How long the old half of a rename waits for its new half before it
    /// counts as a delete.
    pub rename_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            current_user: None,
            retry_attempts: 3,
            retry_backoff: Backoff::default(),
            auto_lock: false,
            set_lock_read_only: true,
            lock_timeout: Duration::from_secs(600),
            page_size: 200,
            rename_window: Duration::from_secs(1),
        }
    }
}

/// Everything one synced drive needs. Each drive gets its own context; nothing
/// is shared between drives.
pub struct DriveContext {
    pub mapping: Mapping,
    pub side_store: SideStore,
    pub fs: Arc<dyn PlaceholderFs>,
    pub remote: Arc<dyn RemoteStore>,
    pub locks: PathLocks,
    pub events: EventBus,
    pub config: SyncConfig,
}

impl DriveContext {
    pub fn new(
        mapping: Mapping,
        side_store: SideStore,
        fs: Arc<dyn PlaceholderFs>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            mapping,
            side_store,
            fs,
            remote,
            locks: PathLocks::new(),
            events: EventBus::default(),
            config,
        }
    }

    pub fn items(&self) -> LocalItemState<'_> {
        LocalItemState::new(self.fs.as_ref(), &self.side_store, &self.mapping)
    }

    pub fn owns_lock(&self, lock: &LockInfo) -> bool {
        self.config
            .current_user
            .as_deref()
            .is_some_and(|user| user.eq_ignore_ascii_case(&lock.owner))
    }

    pub(crate) fn relative(&self, path: &Path) -> Result<PathBuf, PathError> {
        let relative = self.mapping.relative(path)?;
        if relative.as_os_str().is_empty() {
            return Err(PathError::Root);
        }
        Ok(relative)
    }

    pub(crate) async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, DavError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DavError>>,
    {
        retry(&self.config.retry_backoff, self.config.retry_attempts, op).await
    }

    /// Stores a server-confirmed version (or the `*` sentinel).
    pub(crate) async fn record_version(
        &self,
        relative: &Path,
        etag: Option<&str>,
    ) -> Result<(), SyncError> {
        let etag = version_or_any(etag);
        self.side_store.set_etag(relative, Some(etag)).await?;
        self.side_store
            .set_columns(relative, &[etag_column(etag)])
            .await?;
        Ok(())
    }

    /// Marks the item as matching its remote version at its current path.
    pub(crate) async fn mark_synced(&self, path: &Path, relative: &Path) -> Result<(), SyncError> {
        let items = self.items();
        items.set_original_path(path, Some(relative)).await?;
        self.side_store
            .remove_columns(relative, &[column_ids::CONFLICT])
            .await?;
        items.set_in_sync(path, true).await
    }

    pub(crate) async fn mark_conflict(&self, path: &Path, relative: &Path) -> Result<(), SyncError> {
        self.side_store
            .set_columns(relative, &[conflict_column()])
            .await?;
        tracing::warn!(path = %path.display(), "conflict: local and remote both changed");
        self.events.emit(SyncEvent::Conflict {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    pub(crate) async fn has_conflict(&self, relative: &Path) -> Result<bool, SyncError> {
        Ok(self
            .side_store
            .has_column(relative, column_ids::CONFLICT)
            .await?)
    }

    /// After a folder moved, points every descendant's original-path marker
    /// at the descendant's new location.
    pub(crate) async fn rebase_markers(&self, folder: &Path) -> Result<(), SyncError> {
        let items = self.items();
        let mut pending = vec![folder.to_path_buf()];
        while let Some(dir) = pending.pop() {
            if !self.fs.is_folder(&dir).await? {
                continue;
            }
            for child in self.fs.list_children(&dir).await? {
                if items.original_path(&child).await?.is_some() {
                    let relative = self.mapping.relative(&child)?;
                    items.set_original_path(&child, Some(&relative)).await?;
                }
                pending.push(child);
            }
        }
        Ok(())
    }

    /// The lock this client took on the item, if it still holds one.
    pub(crate) async fn held_lock(&self, relative: &Path) -> Result<Option<LockInfo>, SyncError> {
        let Some(lock) = self.side_store.get_lock_info(relative).await? else {
            return Ok(None);
        };
        if self.side_store.get_lock_mode(relative).await? == LockMode::None {
            return Ok(None);
        }
        Ok(Some(lock))
    }

    pub(crate) fn notify_synced(&self, path: &Path, direction: Direction) {
        self.events.emit(SyncEvent::ItemSynced {
            path: path.to_path_buf(),
            direction,
        });
    }

    pub(crate) fn notify_deferred(&self, path: &Path, reason: String) {
        tracing::info!(path = %path.display(), %reason, "deferring until the next pass");
        self.events.emit(SyncEvent::ItemDeferred {
            path: path.to_path_buf(),
            reason,
        });
    }

    pub(crate) fn report_failure(&self, path: &Path, op: &str, err: &SyncError) {
        tracing::warn!(path = %path.display(), op, error = %err, "sync failed");
        self.events.emit(SyncEvent::ItemFailed {
            path: path.to_path_buf(),
            error: err.to_string(),
        });
    }
}

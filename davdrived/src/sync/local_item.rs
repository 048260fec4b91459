use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::SyncError;
use super::mapping::{Mapping, from_slash, paths_equal, to_slash};
use super::placeholder::{ItemAttributes, PlaceholderFs};
use super::side_store::{SideStore, column_ids};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemLifecycle {
    New,
    InSync,
    Modified,
    Moved,
    Conflicted,
    Locked,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ItemCustomData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_path: Option<String>,
}

/// Reads and writes the local half of an item's sync state: placeholder
/// attributes, the in-sync flag and the original-path marker. No network.
pub struct LocalItemState<'a> {
    fs: &'a dyn PlaceholderFs,
    side_store: &'a SideStore,
    mapping: &'a Mapping,
}

impl<'a> LocalItemState<'a> {
    pub fn new(fs: &'a dyn PlaceholderFs, side_store: &'a SideStore, mapping: &'a Mapping) -> Self {
        Self {
            fs,
            side_store,
            mapping,
        }
    }

    pub async fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path).await
    }

    pub async fn is_file(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(!self.fs.is_folder(path).await?)
    }

    pub async fn attributes(&self, path: &Path) -> Result<ItemAttributes, SyncError> {
        Ok(self.fs.attributes(path).await?)
    }

    pub async fn is_offline(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(self.attributes(path).await?.offline)
    }

    pub async fn is_pinned(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(self.attributes(path).await?.pinned)
    }

    pub async fn is_unpinned(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(self.attributes(path).await?.unpinned)
    }

    /// Returns whether the attribute changed.
    pub async fn set_read_only(&self, path: &Path, read_only: bool) -> Result<bool, SyncError> {
        let mut attributes = self.attributes(path).await?;
        if attributes.read_only == read_only {
            return Ok(false);
        }
        attributes.read_only = read_only;
        self.fs.set_attributes(path, attributes).await?;
        Ok(true)
    }

    pub async fn in_sync(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(self.fs.in_sync(path).await?)
    }

    pub async fn set_in_sync(&self, path: &Path, in_sync: bool) -> Result<(), SyncError> {
        Ok(self.fs.set_in_sync(path, in_sync).await?)
    }

    /// The namespace-relative path recorded at the last successful sync.
    pub async fn original_path(&self, path: &Path) -> Result<Option<PathBuf>, SyncError> {
        let Some(bytes) = self.fs.custom_data(path).await? else {
            return Ok(None);
        };
        let data: ItemCustomData = match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable item marker");
                return Ok(None);
            }
        };
        match data.original_path {
            Some(value) => Ok(Some(from_slash(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_original_path(
        &self,
        path: &Path,
        relative: Option<&Path>,
    ) -> Result<(), SyncError> {
        let original_path = relative.map(to_slash).transpose()?;
        if original_path.is_none() {
            return Ok(self.fs.set_custom_data(path, None).await?);
        }
        let data = ItemCustomData { original_path };
        let bytes = serde_json::to_vec(&data).map_err(std::io::Error::other)?;
        Ok(self.fs.set_custom_data(path, Some(&bytes)).await?)
    }

    /// Never synced: no ETag record and no original-path marker. Both are
    /// checked because a delete-and-recreate save drops the marker while the
    /// ETag survives in the side-store.
    pub async fn is_new(&self, path: &Path) -> Result<bool, SyncError> {
        let relative = self.mapping.relative(path)?;
        if self.side_store.get_etag(&relative).await?.is_some() {
            return Ok(false);
        }
        Ok(self.original_path(path).await?.is_none())
    }

    pub async fn is_moved(&self, path: &Path) -> Result<bool, SyncError> {
        Ok(self.move_source(path).await?.is_some())
    }

    /// The path the item was last synced under, when it has moved since.
    pub async fn move_source(&self, path: &Path) -> Result<Option<PathBuf>, SyncError> {
        let Some(original) = self.original_path(path).await? else {
            return Ok(None);
        };
        let current = to_slash(&self.mapping.relative(path)?)?;
        if paths_equal(&to_slash(&original)?, &current) {
            return Ok(None);
        }
        Ok(Some(original))
    }

    pub async fn hydration_required(&self, path: &Path) -> Result<bool, SyncError> {
        if !self.is_file(path).await? {
            return Ok(false);
        }
        let attributes = self.attributes(path).await?;
        Ok(attributes.pinned && attributes.offline)
    }

    pub async fn dehydration_required(&self, path: &Path) -> Result<bool, SyncError> {
        if !self.is_file(path).await? {
            return Ok(false);
        }
        let attributes = self.attributes(path).await?;
        Ok(attributes.unpinned && !attributes.offline)
    }

    pub async fn lifecycle(&self, path: &Path) -> Result<ItemLifecycle, SyncError> {
        if self.is_new(path).await? {
            return Ok(ItemLifecycle::New);
        }
        let relative = self.mapping.relative(path)?;
        if self
            .side_store
            .has_column(&relative, column_ids::CONFLICT)
            .await?
        {
            return Ok(ItemLifecycle::Conflicted);
        }
        if self.is_moved(path).await? {
            return Ok(ItemLifecycle::Moved);
        }
        if !self.in_sync(path).await? {
            return Ok(ItemLifecycle::Modified);
        }
        if self.side_store.get_lock_info(&relative).await?.is_some() {
            return Ok(ItemLifecycle::Locked);
        }
        Ok(ItemLifecycle::InSync)
    }
}

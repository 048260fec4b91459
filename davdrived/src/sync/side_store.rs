use std::io;
use std::path::{Path, PathBuf};

use davdrive_core::LockInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::mapping::PathError;
use super::shadow::{ShadowTree, relocate, remove_path};

const ETAG_SUFFIX: &str = ".etag";
const LOCK_INFO_SUFFIX: &str = ".lockinfo";
const LOCK_MODE_SUFFIX: &str = ".lockmode";
const COLUMNS_SUFFIX: &str = ".columns";

const RECORD_SUFFIXES: [&str; 4] = [ETAG_SUFFIX, LOCK_INFO_SUFFIX, LOCK_MODE_SUFFIX, COLUMNS_SUFFIX];

pub mod column_ids {
    pub const LOCK_OWNER: u32 = 2;
    pub const LOCK_SCOPE: u32 = 4;
    pub const LOCK_EXPIRES: u32 = 5;
    pub const ETAG: u32 = 6;
    pub const CONFLICT: u32 = 7;

    pub const LOCK: [u32; 3] = [LOCK_OWNER, LOCK_SCOPE, LOCK_EXPIRES];
}

#[derive(Debug, Error)]
pub enum SideStoreError {
    #[error("side-store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("side-store record is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("unknown lock mode byte {0}")]
    InvalidLockMode(u8),
}

/// How a lock was taken, which decides whether closing the file releases it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    None,
    Auto,
    Manual,
}

impl LockMode {
    fn to_byte(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Auto => 1,
            LockMode::Manual => 2,
        }
    }

    fn from_byte(value: u8) -> Result<Self, SideStoreError> {
        match value {
            0 => Ok(LockMode::None),
            1 => Ok(LockMode::Auto),
            2 => Ok(LockMode::Manual),
            other => Err(SideStoreError::InvalidLockMode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: u32,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Column {
    pub fn new(id: u32, value: impl Into<String>) -> Self {
        Self {
            id,
            value: value.into(),
            icon: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

pub fn etag_column(etag: &str) -> Column {
    Column::new(column_ids::ETAG, etag)
}

pub fn conflict_column() -> Column {
    Column::new(column_ids::CONFLICT, "Conflict").with_icon("conflict")
}

pub fn lock_columns(lock: &LockInfo) -> Vec<Column> {
    let scope = if lock.exclusive { "Exclusive" } else { "Shared" };
    vec![
        Column::new(column_ids::LOCK_OWNER, lock.owner.clone()).with_icon("locked"),
        Column::new(column_ids::LOCK_SCOPE, scope),
        Column::new(
            column_ids::LOCK_EXPIRES,
            lock.expires_at.clone().unwrap_or_default(),
        ),
    ]
}

/// A lock whose expiry cannot be parsed is treated as live.
pub fn lock_is_expired(lock: &LockInfo) -> bool {
    lock.expires_at
        .as_deref()
        .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok())
        .is_some_and(|expires| expires <= OffsetDateTime::now_utc())
}

/// Per-item metadata kept outside the placeholder, keyed by namespace-relative
/// path. An `.etag` record is written only after the server confirmed a
/// version; empty and missing records both read as absent.
#[derive(Debug, Clone)]
pub struct SideStore {
    tree: ShadowTree,
}

impl SideStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            tree: ShadowTree::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.tree.root()
    }

    pub async fn get_etag(&self, relative: &Path) -> Result<Option<String>, SideStoreError> {
        let path = self.tree.record_path(relative, ETAG_SUFFIX)?;
        Ok(read_optional(&path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|etag| !etag.is_empty()))
    }

    /// `None` and `Some("")` both delete the record.
    pub async fn set_etag(
        &self,
        relative: &Path,
        etag: Option<&str>,
    ) -> Result<(), SideStoreError> {
        let path = self.tree.record_path(relative, ETAG_SUFFIX)?;
        match etag.filter(|etag| !etag.is_empty()) {
            Some(etag) => write_atomic(&path, etag.as_bytes()).await,
            None => Ok(remove_path(&path).await?),
        }
    }

    /// Expired locks are purged as they are read.
    pub async fn get_lock_info(&self, relative: &Path) -> Result<Option<LockInfo>, SideStoreError> {
        let path = self.tree.record_path(relative, LOCK_INFO_SUFFIX)?;
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        let lock: LockInfo = serde_json::from_slice(&bytes)?;
        if lock_is_expired(&lock) {
            tracing::debug!(path = %relative.display(), owner = %lock.owner, "purging expired lock record");
            self.clear_lock(relative).await?;
            return Ok(None);
        }
        Ok(Some(lock))
    }

    pub async fn set_lock_info(
        &self,
        relative: &Path,
        lock: Option<&LockInfo>,
    ) -> Result<(), SideStoreError> {
        let path = self.tree.record_path(relative, LOCK_INFO_SUFFIX)?;
        match lock {
            Some(lock) => write_atomic(&path, &serde_json::to_vec(lock)?).await,
            None => Ok(remove_path(&path).await?),
        }
    }

    pub async fn get_lock_mode(&self, relative: &Path) -> Result<LockMode, SideStoreError> {
        let path = self.tree.record_path(relative, LOCK_MODE_SUFFIX)?;
        match read_optional(&path).await?.as_deref() {
            Some([byte]) => LockMode::from_byte(*byte),
            _ => Ok(LockMode::None),
        }
    }

    pub async fn set_lock_mode(&self, relative: &Path, mode: LockMode) -> Result<(), SideStoreError> {
        let path = self.tree.record_path(relative, LOCK_MODE_SUFFIX)?;
        if mode == LockMode::None {
            return Ok(remove_path(&path).await?);
        }
        write_atomic(&path, &[mode.to_byte()]).await
    }

    /// Drops the lock record, its mode and the lock columns together.
    pub async fn clear_lock(&self, relative: &Path) -> Result<(), SideStoreError> {
        self.set_lock_info(relative, None).await?;
        self.set_lock_mode(relative, LockMode::None).await?;
        self.remove_columns(relative, &column_ids::LOCK).await
    }

    pub async fn columns(&self, relative: &Path) -> Result<Vec<Column>, SideStoreError> {
        let path = self.tree.record_path(relative, COLUMNS_SUFFIX)?;
        match read_optional(&path).await? {
            Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn has_column(&self, relative: &Path, id: u32) -> Result<bool, SideStoreError> {
        Ok(self.columns(relative).await?.iter().any(|column| column.id == id))
    }

    /// Merges `update` into the stored set by id and rewrites the whole set.
    pub async fn set_columns(&self, relative: &Path, update: &[Column]) -> Result<(), SideStoreError> {
        let mut columns = self.columns(relative).await?;
        for column in update {
            match columns.iter_mut().find(|existing| existing.id == column.id) {
                Some(existing) => *existing = column.clone(),
                None => columns.push(column.clone()),
            }
        }
        columns.sort_by_key(|column| column.id);
        self.write_columns(relative, &columns).await
    }

    pub async fn remove_columns(&self, relative: &Path, ids: &[u32]) -> Result<(), SideStoreError> {
        let mut columns = self.columns(relative).await?;
        let before = columns.len();
        columns.retain(|column| !ids.contains(&column.id));
        if columns.len() == before {
            return Ok(());
        }
        self.write_columns(relative, &columns).await
    }

    async fn write_columns(&self, relative: &Path, columns: &[Column]) -> Result<(), SideStoreError> {
        let path = self.tree.record_path(relative, COLUMNS_SUFFIX)?;
        if columns.is_empty() {
            return Ok(remove_path(&path).await?);
        }
        write_atomic(&path, &serde_json::to_vec(columns)?).await
    }

    /// Relocates every record of the item and, for folders, of its subtree.
    pub async fn move_to(&self, from: &Path, to: &Path) -> Result<(), SideStoreError> {
        for suffix in RECORD_SUFFIXES {
            relocate(
                &self.tree.record_path(from, suffix)?,
                &self.tree.record_path(to, suffix)?,
            )
            .await?;
        }
        relocate(&self.tree.children_dir(from)?, &self.tree.children_dir(to)?).await?;
        Ok(())
    }

    pub async fn delete(&self, relative: &Path) -> Result<(), SideStoreError> {
        for suffix in RECORD_SUFFIXES {
            remove_path(&self.tree.record_path(relative, suffix)?).await?;
        }
        remove_path(&self.tree.children_dir(relative)?).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SideStoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{:08x}.tmp", rand::random::<u32>()));
    let temp = PathBuf::from(temp);
    tokio::fs::write(&temp, bytes).await?;
    if let Err(err) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err.into());
    }
    Ok(())
}

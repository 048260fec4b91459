use std::io;
use std::path::PathBuf;

use davdrive_core::DavError;
use thiserror::Error;

use super::mapping::PathError;
use super::side_store::SideStoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{} changed on both sides since the last sync", .0.display())]
    Conflict(PathBuf),
    #[error("{} already exists in the remote store", .0.display())]
    Exists(PathBuf),
    #[error("{} is locked by {owner}", path.display())]
    LockedByAnother { path: PathBuf, owner: String },
    #[error("remote store error: {0}")]
    Remote(#[from] DavError),
    #[error(transparent)]
    SideStore(#[from] SideStoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Failures worth retrying later rather than reporting as permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_retryable() || err.is_locked(),
            SyncError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_not_found(),
            SyncError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// What a single-item sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// State was changed on at least one side.
    Synced,
    /// Already consistent.
    Unchanged,
    /// Not applicable: excluded, out of scope or not materialized.
    Skipped,
    /// Temporarily impossible; a later pass retries.
    Deferred,
}

impl SyncOutcome {
    pub fn is_mutation(self) -> bool {
        self == SyncOutcome::Synced
    }
}

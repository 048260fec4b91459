use std::io;
use std::path::{Component, Path, PathBuf};

use super::mapping::PathError;

const CHILDREN_SUFFIX: &str = ".d";

/// A directory tree mirroring the sync namespace. Each item owns sidecar files
/// `<name><suffix>` next to its siblings' sidecars, and a folder's children live
/// in `<name>.d/`, so a plain directory rename or removal carries a whole
/// subtree of records along.
#[derive(Debug, Clone)]
pub struct ShadowTree {
    root: PathBuf,
}

impl ShadowTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, relative: &Path, suffix: &str) -> Result<PathBuf, PathError> {
        let (dir, name) = self.split(relative)?;
        Ok(dir.join(format!("{name}{suffix}")))
    }

    pub fn children_dir(&self, relative: &Path) -> Result<PathBuf, PathError> {
        self.record_path(relative, CHILDREN_SUFFIX)
    }

    fn split(&self, relative: &Path) -> Result<(PathBuf, String), PathError> {
        let mut names = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => names.push(part.to_str().ok_or(PathError::NonUtf8)?),
                Component::CurDir => {}
                _ => return Err(PathError::UnsupportedComponent),
            }
        }
        let name = names.pop().ok_or(PathError::Root)?.to_string();
        let mut dir = self.root.clone();
        for parent in names {
            dir.push(format!("{parent}{CHILDREN_SUFFIX}"));
        }
        Ok((dir, name))
    }
}

/// Moves a file or directory, replacing whatever sits at `to`. Falls back to
/// copy-then-delete when rename fails, so the source is only removed once the
/// copy is complete. Returns false when there was nothing to move.
pub async fn relocate(from: &Path, to: &Path) -> io::Result<bool> {
    if !tokio::fs::try_exists(from).await? {
        return Ok(false);
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    remove_path(to).await?;
    if let Err(err) = tokio::fs::rename(from, to).await {
        tracing::debug!(
            from = %from.display(),
            to = %to.display(),
            error = %err,
            "rename failed, copying instead"
        );
        let (source, target) = (from.to_path_buf(), to.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(io::Error::other)??;
        remove_path(from).await?;
    }
    Ok(true)
}

pub async fn remove_path(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    if !meta.is_dir() {
        std::fs::copy(from, to)?;
        return Ok(());
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        copy_tree(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

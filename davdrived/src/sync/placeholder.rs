use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::mapping::PathError;
use super::shadow::{ShadowTree, relocate, remove_path};

const STATE_SUFFIX: &str = ".placeholder";
// The root has no name, so "" + suffix cannot clash with any item record.
const ROOT_STATE_FILE: &str = ".placeholder";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemAttributes {
    pub read_only: bool,
    pub hidden: bool,
    pub temporary: bool,
    /// Content is not present locally.
    pub offline: bool,
    /// Keep content local.
    pub pinned: bool,
    /// Free local content.
    pub unpinned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
}

/// The local storage engine. Paths are absolute paths under the sync root.
#[async_trait]
pub trait PlaceholderFs: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn is_folder(&self, path: &Path) -> io::Result<bool>;

    async fn is_placeholder(&self, path: &Path) -> io::Result<bool>;

    async fn attributes(&self, path: &Path) -> io::Result<ItemAttributes>;

    async fn set_attributes(&self, path: &Path, attributes: ItemAttributes) -> io::Result<()>;

    /// Creates an offline file or an empty folder under `parent`.
    async fn create_placeholder(&self, parent: &Path, info: &PlaceholderInfo)
    -> io::Result<PathBuf>;

    async fn convert_to_placeholder(&self, path: &Path) -> io::Result<()>;

    async fn custom_data(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    async fn set_custom_data(&self, path: &Path, data: Option<&[u8]>) -> io::Result<()>;

    async fn in_sync(&self, path: &Path) -> io::Result<bool>;

    async fn set_in_sync(&self, path: &Path, in_sync: bool) -> io::Result<()>;

    async fn read_content(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replaces file content and clears `offline`.
    async fn write_content(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    /// Drops file content and sets `offline`.
    async fn dehydrate(&self, path: &Path) -> io::Result<()>;

    async fn move_item(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Called after something outside the engine renamed an item, so state
    /// kept apart from the item can follow it.
    async fn track_rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        Ok(())
    }

    async fn delete_item(&self, path: &Path) -> io::Result<()>;

    async fn list_children(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PlaceholderState {
    #[serde(default)]
    inode: u64,
    #[serde(default)]
    attributes: ItemAttributes,
    #[serde(default)]
    in_sync: bool,
    #[serde(default)]
    snapshot: Option<Snapshot>,
    #[serde(default)]
    custom_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Snapshot {
    len: u64,
    modified_ns: u64,
}

impl Snapshot {
    fn of(meta: &std::fs::Metadata) -> Self {
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_nanos().min(u128::from(u64::MAX)) as u64)
            .unwrap_or_default();
        Self {
            len: meta.len(),
            modified_ns,
        }
    }
}

/// Placeholder emulation on a plain directory. Items are ordinary files; their
/// placeholder state lives in a separate shadow tree and is discarded whenever
/// the inode behind the path changes, the way a delete-and-recreate save drops
/// platform placeholder data. A file's in-sync flag holds only while its length
/// and mtime match the snapshot taken when the flag was set.
#[derive(Debug, Clone)]
pub struct DirPlaceholderFs {
    root: PathBuf,
    state: ShadowTree,
}

impl DirPlaceholderFs {
    pub fn new(root: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: ShadowTree::new(state_root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative<'a>(&self, path: &'a Path) -> io::Result<&'a Path> {
        path.strip_prefix(&self.root)
            .map_err(|_| invalid(PathError::OutsideRoot(path.to_path_buf())))
    }

    fn state_file(&self, path: &Path) -> io::Result<PathBuf> {
        let relative = self.relative(path)?;
        if relative.as_os_str().is_empty() {
            return Ok(self.state.root().join(ROOT_STATE_FILE));
        }
        self.state
            .record_path(relative, STATE_SUFFIX)
            .map_err(invalid)
    }

    fn state_children(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        let relative = self.relative(path)?;
        if relative.as_os_str().is_empty() {
            return Ok(None);
        }
        self.state.children_dir(relative).map(Some).map_err(invalid)
    }

    /// State for `path`, or `None` when it is not a placeholder (or the inode
    /// changed since the state was written).
    async fn load(&self, path: &Path) -> io::Result<Option<(PlaceholderState, std::fs::Metadata)>> {
        let meta = tokio::fs::metadata(path).await?;
        let bytes = match tokio::fs::read(self.state_file(path)?).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let state: PlaceholderState = serde_json::from_slice(&bytes).map_err(invalid)?;
        if state.inode != inode(&meta) {
            return Ok(None);
        }
        Ok(Some((state, meta)))
    }

    async fn load_or_default(&self, path: &Path) -> io::Result<(PlaceholderState, std::fs::Metadata)> {
        match self.load(path).await? {
            Some(loaded) => Ok(loaded),
            None => {
                let meta = tokio::fs::metadata(path).await?;
                let state = PlaceholderState {
                    inode: inode(&meta),
                    ..PlaceholderState::default()
                };
                Ok((state, meta))
            }
        }
    }

    async fn store(&self, path: &Path, state: &PlaceholderState) -> io::Result<()> {
        let file = self.state_file(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file, serde_json::to_vec(state).map_err(invalid)?).await
    }

    /// Rewrites the state after a content change made by the engine itself,
    /// keeping the in-sync flag valid against the new length and mtime.
    async fn refresh(&self, path: &Path, mut state: PlaceholderState) -> io::Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        state.inode = inode(&meta);
        if state.in_sync {
            state.snapshot = Some(Snapshot::of(&meta));
        }
        self.store(path, &state).await
    }
}

#[async_trait]
impl PlaceholderFs for DirPlaceholderFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn is_folder(&self, path: &Path) -> io::Result<bool> {
        Ok(tokio::fs::metadata(path).await?.is_dir())
    }

    async fn is_placeholder(&self, path: &Path) -> io::Result<bool> {
        Ok(self.load(path).await?.is_some())
    }

    async fn attributes(&self, path: &Path) -> io::Result<ItemAttributes> {
        let (state, meta) = self.load_or_default(path).await?;
        let mut attributes = state.attributes;
        attributes.read_only = meta.permissions().readonly();
        Ok(attributes)
    }

    async fn set_attributes(&self, path: &Path, attributes: ItemAttributes) -> io::Result<()> {
        let (mut state, meta) = self.load_or_default(path).await?;
        if meta.is_file() && meta.permissions().readonly() != attributes.read_only {
            set_readonly(path, attributes.read_only).await?;
        }
        state.attributes = attributes;
        self.store(path, &state).await
    }

    async fn create_placeholder(
        &self,
        parent: &Path,
        info: &PlaceholderInfo,
    ) -> io::Result<PathBuf> {
        let path = parent.join(&info.name);
        if info.is_folder {
            tokio::fs::create_dir(&path).await?;
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await?;
        }
        let meta = tokio::fs::metadata(&path).await?;
        let state = PlaceholderState {
            inode: inode(&meta),
            attributes: ItemAttributes {
                offline: !info.is_folder,
                ..ItemAttributes::default()
            },
            ..PlaceholderState::default()
        };
        self.store(&path, &state).await?;
        Ok(path)
    }

    async fn convert_to_placeholder(&self, path: &Path) -> io::Result<()> {
        let (state, _) = self.load_or_default(path).await?;
        self.store(path, &state).await
    }

    async fn custom_data(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .load(path)
            .await?
            .and_then(|(state, _)| state.custom_data))
    }

    async fn set_custom_data(&self, path: &Path, data: Option<&[u8]>) -> io::Result<()> {
        let (mut state, _) = self.load_or_default(path).await?;
        state.custom_data = data.map(<[u8]>::to_vec);
        self.store(path, &state).await
    }

    async fn in_sync(&self, path: &Path) -> io::Result<bool> {
        let Some((state, meta)) = self.load(path).await? else {
            return Ok(false);
        };
        if !state.in_sync {
            return Ok(false);
        }
        if meta.is_dir() {
            return Ok(true);
        }
        Ok(state.snapshot == Some(Snapshot::of(&meta)))
    }

    async fn set_in_sync(&self, path: &Path, in_sync: bool) -> io::Result<()> {
        let (mut state, meta) = self.load_or_default(path).await?;
        state.in_sync = in_sync;
        state.snapshot = (in_sync && meta.is_file()).then(|| Snapshot::of(&meta));
        self.store(path, &state).await
    }

    async fn read_content(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write_content(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let (existing, read_only) = match tokio::fs::metadata(path).await {
            Ok(meta) => (self.load(path).await?, meta.permissions().readonly()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (None, false),
            Err(err) => return Err(err),
        };
        if read_only {
            set_readonly(path, false).await?;
        }
        let written = tokio::fs::write(path, content).await;
        if read_only {
            set_readonly(path, true).await?;
        }
        written?;
        let mut state = existing.map(|(state, _)| state).unwrap_or_default();
        state.attributes.offline = false;
        self.refresh(path, state).await
    }

    async fn dehydrate(&self, path: &Path) -> io::Result<()> {
        let (mut state, meta) = self.load_or_default(path).await?;
        if meta.is_dir() {
            return Ok(());
        }
        let read_only = meta.permissions().readonly();
        if read_only {
            set_readonly(path, false).await?;
        }
        let truncated = async {
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(0).await
        }
        .await;
        if read_only {
            set_readonly(path, true).await?;
        }
        truncated?;
        // A dehydrated file keeps whatever in-sync state it had.
        if state.in_sync && state.snapshot != Some(Snapshot::of(&meta)) {
            state.in_sync = false;
        }
        state.attributes.offline = true;
        self.refresh(path, state).await
    }

    async fn move_item(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        relocate(&self.state_file(from)?, &self.state_file(to)?).await?;
        if let (Some(from), Some(to)) = (self.state_children(from)?, self.state_children(to)?) {
            relocate(&from, &to).await?;
        }
        Ok(())
    }

    async fn track_rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from_state = self.state_file(from)?;
        let bytes = match tokio::fs::read(&from_state).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        let state: PlaceholderState = serde_json::from_slice(&bytes).map_err(invalid)?;
        let meta = tokio::fs::metadata(to).await?;
        if state.inode != inode(&meta) {
            return Ok(());
        }
        relocate(&from_state, &self.state_file(to)?).await?;
        if let (Some(from), Some(to)) = (self.state_children(from)?, self.state_children(to)?) {
            relocate(&from, &to).await?;
        }
        Ok(())
    }

    async fn delete_item(&self, path: &Path) -> io::Result<()> {
        remove_path(path).await?;
        remove_path(&self.state_file(path)?).await?;
        if let Some(children) = self.state_children(path)? {
            remove_path(&children).await?;
        }
        Ok(())
    }

    async fn list_children(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.path());
        }
        children.sort();
        Ok(children)
    }
}

async fn set_readonly(path: &Path, read_only: bool) -> io::Result<()> {
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_readonly(read_only);
    tokio::fs::set_permissions(path, permissions).await
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

fn invalid<E>(err: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fs_in(dir: &Path) -> DirPlaceholderFs {
        std::fs::create_dir_all(dir.join("root")).unwrap();
        DirPlaceholderFs::new(dir.join("root"), dir.join("state"))
    }

    #[tokio::test]
    async fn local_write_clears_in_sync() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let file = fs.root().join("a.txt");
        std::fs::write(&file, "one").unwrap();

        fs.set_in_sync(&file, true).await.unwrap();
        assert!(fs.in_sync(&file).await.unwrap());

        std::fs::write(&file, "longer content").unwrap();
        assert!(!fs.in_sync(&file).await.unwrap());
    }

    #[tokio::test]
    async fn recreated_file_loses_placeholder_state() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let file = fs.root().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        fs.set_custom_data(&file, Some(b"marker")).await.unwrap();
        assert!(fs.is_placeholder(&file).await.unwrap());

        // Hold the old inode open so the new file cannot reuse it.
        let keep = dir.path().join("keep");
        std::fs::rename(&file, &keep).unwrap();
        std::fs::write(&file, "one").unwrap();

        assert!(!fs.is_placeholder(&file).await.unwrap());
        assert_eq!(fs.custom_data(&file).await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_placeholder_is_offline_until_written() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let info = PlaceholderInfo {
            name: "b.txt".into(),
            is_folder: false,
            size: 5,
        };
        let path = fs.create_placeholder(fs.root(), &info).await.unwrap();
        assert!(fs.attributes(&path).await.unwrap().offline);

        fs.write_content(&path, b"hello").await.unwrap();
        assert!(!fs.attributes(&path).await.unwrap().offline);
        assert_eq!(fs.read_content(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn write_content_keeps_in_sync_and_read_only() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let file = fs.root().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        fs.set_in_sync(&file, true).await.unwrap();
        let attributes = ItemAttributes {
            read_only: true,
            ..fs.attributes(&file).await.unwrap()
        };
        fs.set_attributes(&file, attributes).await.unwrap();

        fs.write_content(&file, b"two and more").await.unwrap();

        assert!(fs.in_sync(&file).await.unwrap());
        assert!(fs.attributes(&file).await.unwrap().read_only);
        assert_eq!(fs.read_content(&file).await.unwrap(), b"two and more");
    }

    #[tokio::test]
    async fn dehydrate_sets_offline_and_keeps_in_sync() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let file = fs.root().join("a.txt");
        std::fs::write(&file, "content").unwrap();
        fs.set_in_sync(&file, true).await.unwrap();

        fs.dehydrate(&file).await.unwrap();

        assert!(fs.attributes(&file).await.unwrap().offline);
        assert!(fs.in_sync(&file).await.unwrap());
        assert!(fs.read_content(&file).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_carries_state_for_subtree() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let folder = fs.root().join("Docs");
        std::fs::create_dir(&folder).unwrap();
        let file = folder.join("a.txt");
        std::fs::write(&file, "x").unwrap();
        fs.set_in_sync(&folder, true).await.unwrap();
        fs.set_custom_data(&file, Some(b"m")).await.unwrap();

        let target = fs.root().join("Archive/Docs");
        fs.move_item(&folder, &target).await.unwrap();

        assert!(fs.in_sync(&target).await.unwrap());
        assert_eq!(
            fs.custom_data(&target.join("a.txt")).await.unwrap(),
            Some(b"m".to_vec())
        );
    }

    #[tokio::test]
    async fn external_rename_keeps_state_when_tracked() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let from = fs.root().join("a.txt");
        let to = fs.root().join("b.txt");
        std::fs::write(&from, "x").unwrap();
        fs.set_in_sync(&from, true).await.unwrap();

        std::fs::rename(&from, &to).unwrap();
        assert!(!fs.in_sync(&to).await.unwrap());

        fs.track_rename(&from, &to).await.unwrap();
        assert!(fs.in_sync(&to).await.unwrap());
    }

    #[tokio::test]
    async fn root_keeps_its_own_state() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let root = fs.root().to_path_buf();
        let attributes = ItemAttributes {
            pinned: true,
            ..ItemAttributes::default()
        };
        fs.set_attributes(&root, attributes).await.unwrap();
        assert!(fs.attributes(&root).await.unwrap().pinned);
    }

    #[tokio::test]
    async fn delete_removes_item_and_state() {
        let dir = tempdir().unwrap();
        let fs = fs_in(dir.path());
        let file = fs.root().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        fs.set_in_sync(&file, true).await.unwrap();

        fs.delete_item(&file).await.unwrap();

        assert!(!fs.exists(&file).await);
        assert!(!dir.path().join("state/a.txt.placeholder").exists());
    }
}

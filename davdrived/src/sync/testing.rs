use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use davdrive_core::{
    ChildrenPage, DavError, ItemKind, LockInfo, LockScope, RemoteItem, RemoteStore,
};
use reqwest::StatusCode;

#[derive(Debug, Clone)]
struct Entry {
    kind: ItemKind,
    content: Vec<u8>,
    version: u64,
    lock: Option<LockInfo>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    next_version: u64,
    next_token: u64,
    mutations: usize,
    fail_next: Option<StatusCode>,
    failing: HashMap<String, StatusCode>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// In-memory remote store. Files carry ETags `v<n>`; folders have none. Paths
/// compare case-sensitively and the root `/` always exists.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    /// Lock owner reported for locks taken through this store.
    owner: String,
}

fn api(status: StatusCode) -> DavError {
    DavError::Api {
        status,
        body: String::new(),
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn is_within(path: &str, folder: &str) -> bool {
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

impl MemoryRemote {
    pub fn new(owner: &str) -> Self {
        Self {
            state: Mutex::new(State::default()),
            owner: owner.to_string(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn check_fail(state: &mut State, path: &str) -> Result<(), DavError> {
        if let Some(status) = state.fail_next.take() {
            return Err(api(status));
        }
        match state.failing.get(path) {
            Some(status) => Err(api(*status)),
            None => Ok(()),
        }
    }

    fn folder_exists(state: &State, path: &str) -> bool {
        path == "/"
            || state
                .entries
                .get(path)
                .is_some_and(|entry| entry.kind == ItemKind::Folder)
    }

    fn item(path: &str, entry: &Entry) -> RemoteItem {
        RemoteItem {
            path: path.to_string(),
            name: name_of(path).to_string(),
            kind: entry.kind,
            etag: (entry.kind == ItemKind::File).then(|| format!("v{}", entry.version)),
            size: Some(entry.content.len() as u64),
            modified: None,
            lock: entry.lock.clone(),
        }
    }

    pub fn put_file(&self, path: &str, content: &str) -> String {
        self.with_state(|state| {
            let version = state.bump();
            let lock = state.entries.get(path).and_then(|entry| entry.lock.clone());
            state.entries.insert(
                path.to_string(),
                Entry {
                    kind: ItemKind::File,
                    content: content.as_bytes().to_vec(),
                    version,
                    lock,
                },
            );
            format!("v{version}")
        })
    }

    pub fn put_folder(&self, path: &str) {
        self.with_state(|state| {
            let version = state.bump();
            state.entries.insert(
                path.to_string(),
                Entry {
                    kind: ItemKind::Folder,
                    content: Vec::new(),
                    version,
                    lock: None,
                },
            );
        });
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.with_state(|state| {
            state
                .entries
                .get(path)
                .map(|entry| String::from_utf8_lossy(&entry.content).into_owned())
        })
    }

    pub fn etag(&self, path: &str) -> Option<String> {
        self.with_state(|state| state.entries.get(path).map(|entry| format!("v{}", entry.version)))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.with_state(|state| state.entries.contains_key(path))
    }

    /// Write-type calls that succeeded.
    pub fn mutations(&self) -> usize {
        self.with_state(|state| state.mutations)
    }

    /// Fails the next call, whatever it is.
    pub fn fail_next(&self, status: StatusCode) {
        self.with_state(|state| state.fail_next = Some(status));
    }

    /// Fails every call on `path` until cleared with `None`.
    pub fn fail_path(&self, path: &str, status: Option<StatusCode>) {
        self.with_state(|state| match status {
            Some(status) => {
                state.failing.insert(path.to_string(), status);
            }
            None => {
                state.failing.remove(path);
            }
        });
    }

    /// Simulates a lock taken by another client.
    pub fn set_lock(&self, path: &str, lock: Option<LockInfo>) {
        self.with_state(|state| {
            if let Some(entry) = state.entries.get_mut(path) {
                entry.lock = lock;
            }
        });
    }

    /// Removes an item and its descendants behind the engine's back.
    pub fn remove(&self, path: &str) {
        self.with_state(|state| {
            state
                .entries
                .retain(|key, _| key != path && !is_within(key, path));
        });
    }

    /// Renames an item and its descendants behind the engine's back.
    pub fn rename(&self, from: &str, to: &str) {
        self.with_state(|state| {
            let moved: Vec<(String, Entry)> = state
                .entries
                .iter()
                .filter(|(key, _)| *key == from || is_within(key, from))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect();
            for (key, entry) in moved {
                state.entries.remove(&key);
                let new_key = format!("{to}{}", &key[from.len()..]);
                state.entries.insert(new_key, entry);
            }
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get_item(&self, path: &str) -> Result<RemoteItem, DavError> {
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            if path == "/" {
                return Ok(RemoteItem {
                    path: "/".to_string(),
                    name: String::new(),
                    kind: ItemKind::Folder,
                    etag: None,
                    size: None,
                    modified: None,
                    lock: None,
                });
            }
            state
                .entries
                .get(path)
                .map(|entry| Self::item(path, entry))
                .ok_or_else(|| api(StatusCode::NOT_FOUND))
        })
    }

    async fn list_children(
        &self,
        path: &str,
        _pattern: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ChildrenPage, DavError> {
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            if !Self::folder_exists(state, path) {
                return Err(api(StatusCode::NOT_FOUND));
            }
            let children: Vec<RemoteItem> = state
                .entries
                .iter()
                .filter(|(key, _)| key.as_str() != path && parent_of(key) == path)
                .map(|(key, entry)| Self::item(key, entry))
                .collect();
            let total = children.len() as u32;
            let items = children
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect();
            Ok(ChildrenPage {
                items,
                total,
                limit,
                offset,
            })
        })
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, DavError> {
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            let entry = state
                .entries
                .get(path)
                .ok_or_else(|| api(StatusCode::NOT_FOUND))?;
            let start = (offset as usize).min(entry.content.len());
            let end = match length {
                Some(length) => (start + length as usize).min(entry.content.len()),
                None => entry.content.len(),
            };
            Ok(entry.content[start..end].to_vec())
        })
    }

    async fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        expected_etag: Option<&str>,
        lock_token: Option<&str>,
    ) -> Result<Option<String>, DavError> {
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            let version = state.next_version + 1;
            let entry = state
                .entries
                .get_mut(path)
                .ok_or_else(|| api(StatusCode::NOT_FOUND))?;
            if let Some(lock) = &entry.lock
                && lock.exclusive
                && lock_token != Some(lock.token.as_str())
            {
                return Err(api(StatusCode::LOCKED));
            }
            if let Some(expected) = expected_etag
                && expected != format!("v{}", entry.version)
            {
                return Err(api(StatusCode::PRECONDITION_FAILED));
            }
            entry.content = content;
            entry.version = version;
            state.next_version = version;
            state.mutations += 1;
            Ok(Some(format!("v{version}")))
        })
    }

    async fn create(
        &self,
        parent: &str,
        name: &str,
        kind: ItemKind,
        content: Option<Vec<u8>>,
    ) -> Result<RemoteItem, DavError> {
        let path = join(parent, name);
        self.with_state(|state| {
            Self::check_fail(state, &path)?;
            if !Self::folder_exists(state, parent) {
                return Err(api(StatusCode::NOT_FOUND));
            }
            if state.entries.contains_key(&path) {
                return Err(api(StatusCode::CONFLICT));
            }
            let version = state.bump();
            let entry = Entry {
                kind,
                content: content.unwrap_or_default(),
                version,
                lock: None,
            };
            let item = Self::item(&path, &entry);
            state.entries.insert(path, entry);
            state.mutations += 1;
            Ok(item)
        })
    }

    async fn delete(&self, path: &str) -> Result<(), DavError> {
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            if !state.entries.contains_key(path) {
                return Err(api(StatusCode::NOT_FOUND));
            }
            state
                .entries
                .retain(|key, _| key != path && !is_within(key, path));
            state.mutations += 1;
            Ok(())
        })
    }

    async fn move_item(&self, path: &str, new_parent: &str, new_name: &str) -> Result<(), DavError> {
        let target = join(new_parent, new_name);
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            if !state.entries.contains_key(path) || !Self::folder_exists(state, new_parent) {
                return Err(api(StatusCode::NOT_FOUND));
            }
            if state.entries.contains_key(&target) {
                return Err(api(StatusCode::CONFLICT));
            }
            state.mutations += 1;
            Ok(())
        })?;
        self.rename(path, &target);
        Ok(())
    }

    async fn lock(
        &self,
        path: &str,
        _scope: LockScope,
        _timeout: Duration,
    ) -> Result<LockInfo, DavError> {
        let owner = self.owner.clone();
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            state.next_token += 1;
            let token = format!("opaquelocktoken:{}", state.next_token);
            let entry = state
                .entries
                .get_mut(path)
                .ok_or_else(|| api(StatusCode::NOT_FOUND))?;
            if entry.lock.is_some() {
                return Err(api(StatusCode::LOCKED));
            }
            let lock = LockInfo {
                token,
                owner,
                exclusive: true,
                expires_at: None,
            };
            entry.lock = Some(lock.clone());
            state.mutations += 1;
            Ok(lock)
        })
    }

    async fn unlock(&self, path: &str, token: &str) -> Result<(), DavError> {
        self.with_state(|state| {
            Self::check_fail(state, path)?;
            let entry = state
                .entries
                .get_mut(path)
                .ok_or_else(|| api(StatusCode::NOT_FOUND))?;
            match entry.lock.as_ref().map(|lock| lock.token == token) {
                Some(true) => {
                    entry.lock = None;
                    state.mutations += 1;
                    Ok(())
                }
                Some(false) => Err(api(StatusCode::CONFLICT)),
                None => Err(api(StatusCode::NOT_FOUND)),
            }
        })
    }
}

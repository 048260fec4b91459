use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 256;

/// Serializes sync operations per namespace path. Different paths proceed in
/// parallel; a path's mutex lives only while someone holds or waits on it.
#[derive(Debug, Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

pub struct PathGuard {
    _guard: OwnedMutexGuard<()>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, relative: &Path) -> PathGuard {
        let mutex = self.mutex_for(&key(relative));
        PathGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Locks two paths in a fixed order so concurrent moves cannot deadlock.
    /// The second guard is `None` when both paths are the same item.
    pub async fn lock_pair(&self, first: &Path, second: &Path) -> (PathGuard, Option<PathGuard>) {
        let (a, b) = (key(first), key(second));
        if a == b {
            return (self.lock(first).await, None);
        }
        let (low, high) = if a < b { (first, second) } else { (second, first) };
        let low = self.lock(low).await;
        let high = self.lock(high).await;
        (low, Some(high))
    }

    fn mutex_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        if map.len() >= PRUNE_THRESHOLD {
            map.retain(|_, weak| weak.strong_count() > 0);
        }
        let mutex = Arc::new(AsyncMutex::new(()));
        map.insert(key.to_string(), Arc::downgrade(&mutex));
        mutex
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

fn key(relative: &Path) -> String {
    relative
        .to_string_lossy()
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_lowercase()
}

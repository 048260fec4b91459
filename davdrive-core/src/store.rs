use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ChildrenPage, DavClient, DavError, ItemKind, LockInfo, LockScope, RemoteItem};

/// Remote document store as seen by the sync engine. Paths are absolute
/// remote paths (`/docs/a.txt`).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_item(&self, path: &str) -> Result<RemoteItem, DavError>;

    async fn list_children(
        &self,
        path: &str,
        pattern: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ChildrenPage, DavError>;

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, DavError>;

    async fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        expected_etag: Option<&str>,
        lock_token: Option<&str>,
    ) -> Result<Option<String>, DavError>;

    async fn create(
        &self,
        parent: &str,
        name: &str,
        kind: ItemKind,
        content: Option<Vec<u8>>,
    ) -> Result<RemoteItem, DavError>;

    async fn delete(&self, path: &str) -> Result<(), DavError>;

    async fn move_item(&self, path: &str, new_parent: &str, new_name: &str)
    -> Result<(), DavError>;

    async fn lock(
        &self,
        path: &str,
        scope: LockScope,
        timeout: Duration,
    ) -> Result<LockInfo, DavError>;

    async fn unlock(&self, path: &str, token: &str) -> Result<(), DavError>;
}

#[async_trait]
impl RemoteStore for DavClient {
    async fn get_item(&self, path: &str) -> Result<RemoteItem, DavError> {
        DavClient::get_item(self, path).await
    }

    async fn list_children(
        &self,
        path: &str,
        pattern: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ChildrenPage, DavError> {
        DavClient::list_children(self, path, pattern, limit, offset).await
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, DavError> {
        DavClient::read_range(self, path, offset, length).await
    }

    async fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        expected_etag: Option<&str>,
        lock_token: Option<&str>,
    ) -> Result<Option<String>, DavError> {
        DavClient::write(self, path, content, expected_etag, lock_token).await
    }

    async fn create(
        &self,
        parent: &str,
        name: &str,
        kind: ItemKind,
        content: Option<Vec<u8>>,
    ) -> Result<RemoteItem, DavError> {
        DavClient::create(self, parent, name, kind, content).await
    }

    async fn delete(&self, path: &str) -> Result<(), DavError> {
        DavClient::delete(self, path).await
    }

    async fn move_item(
        &self,
        path: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<(), DavError> {
        DavClient::move_item(self, path, new_parent, new_name).await
    }

    async fn lock(
        &self,
        path: &str,
        scope: LockScope,
        timeout: Duration,
    ) -> Result<LockInfo, DavError> {
        DavClient::lock(self, path, scope, timeout).await
    }

    async fn unlock(&self, path: &str, token: &str) -> Result<(), DavError> {
        DavClient::unlock(self, path, token).await
    }
}

/// Fetches every child of `path`, page by page, reporting
/// `(fetched_so_far, total)` after each page.
pub async fn list_all_children<S, F>(
    store: &S,
    path: &str,
    pattern: &str,
    page_size: u32,
    mut progress: F,
) -> Result<Vec<RemoteItem>, DavError>
where
    S: RemoteStore + ?Sized,
    F: FnMut(usize, u32) + Send,
{
    let page_size = page_size.max(1);
    let mut offset = 0u32;
    let mut items = Vec::new();
    loop {
        let page = store.list_children(path, pattern, page_size, offset).await?;
        let fetched = page.items.len() as u32;
        let total = page.total;
        items.extend(page.items);
        progress(items.len(), total);
        if fetched == 0 || items.len() as u32 >= total {
            break;
        }
        offset = offset.saturating_add(fetched);
    }
    Ok(items)
}

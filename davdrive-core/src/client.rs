use std::time::Duration;

use reqwest::header::{ETAG, IF_MATCH, RANGE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const LOCK_TOKEN_HEADER: &str = "Lock-Token";
const INSTANCE_ID_HEADER: &str = "InstanceId";

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    /// Item already exists, or the `If-Match` version is stale.
    Conflict,
    Locked,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    credentials: Option<Credentials>,
    instance_id: Option<String>,
}

impl DavClient {
    pub fn new(base_url: &str) -> Result<Self, DavError> {
        Self::with_http(Client::new(), base_url)
    }

    pub fn with_http(http: Client, base_url: &str) -> Result<Self, DavError> {
        // Url::join drops the last segment unless the base ends with '/'.
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{base_url}/"))?
        };
        Ok(Self {
            http,
            base_url,
            credentials: None,
            instance_id: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Identifies this client so the server can skip echoing its own changes
    /// back through the change feed.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get_item(&self, path: &str) -> Result<RemoteItem, DavError> {
        let mut url = self.endpoint("v1/items")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.request(Method::GET, url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn list_children(
        &self,
        path: &str,
        pattern: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ChildrenPage, DavError> {
        let mut url = self.endpoint("v1/items/children")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("pattern", pattern)
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self.request(Method::GET, url).send().await?;
        Self::handle_response(response).await
    }

    /// Reads `length` bytes starting at `offset`; `None` reads to the end.
    pub async fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, DavError> {
        let range = match (offset, length) {
            (_, Some(0)) => return Ok(Vec::new()),
            (0, None) => None,
            (offset, None) => Some(format!("bytes={offset}-")),
            (offset, Some(length)) => Some(format!(
                "bytes={offset}-{}",
                offset.saturating_add(length - 1)
            )),
        };
        let mut url = self.endpoint("v1/content")?;
        url.query_pairs_mut().append_pair("path", path);
        let mut request = self.request(Method::GET, url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = Self::check_status(request.send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Replaces file content. Returns the new version token when the server
    /// reports one.
    pub async fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        expected_etag: Option<&str>,
        lock_token: Option<&str>,
    ) -> Result<Option<String>, DavError> {
        let mut url = self.endpoint("v1/content")?;
        url.query_pairs_mut().append_pair("path", path);
        let mut request = self.request(Method::PUT, url).body(content);
        if let Some(etag) = expected_etag.filter(|etag| !etag.is_empty()) {
            request = request.header(IF_MATCH, etag);
        }
        if let Some(token) = lock_token {
            request = request.header(LOCK_TOKEN_HEADER, token);
        }
        let response = Self::check_status(request.send().await?).await?;
        let header_etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        let body_etag = serde_json::from_slice::<WriteResult>(&body)
            .ok()
            .and_then(|result| result.etag);
        Ok(body_etag.or(header_etag).filter(|etag| !etag.is_empty()))
    }

    pub async fn create(
        &self,
        parent: &str,
        name: &str,
        kind: ItemKind,
        content: Option<Vec<u8>>,
    ) -> Result<RemoteItem, DavError> {
        let mut url = self.endpoint("v1/items")?;
        url.query_pairs_mut()
            .append_pair("parent", parent)
            .append_pair("name", name)
            .append_pair("type", kind.as_str());
        let mut request = self.request(Method::POST, url);
        if let Some(content) = content {
            request = request.body(content);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), DavError> {
        let mut url = self.endpoint("v1/items")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.request(Method::DELETE, url).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn move_item(
        &self,
        path: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<(), DavError> {
        let mut url = self.endpoint("v1/items/move")?;
        url.query_pairs_mut()
            .append_pair("from", path)
            .append_pair("parent", new_parent)
            .append_pair("name", new_name);
        let response = self.request(Method::POST, url).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn lock(
        &self,
        path: &str,
        scope: LockScope,
        timeout: Duration,
    ) -> Result<LockInfo, DavError> {
        let mut url = self.endpoint("v1/locks")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("scope", scope.as_str())
            .append_pair("timeout", &timeout.as_secs().to_string());
        let response = self.request(Method::POST, url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn unlock(&self, path: &str, token: &str) -> Result<(), DavError> {
        let mut url = self.endpoint("v1/locks")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .request(Method::DELETE, url)
            .header(LOCK_TOKEN_HEADER, token)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.user, Some(&credentials.password));
        }
        if let Some(instance_id) = &self.instance_id {
            request = request.header(INSTANCE_ID_HEADER, instance_id);
        }
        request
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, DavError> {
        Ok(self.base_url.join(path)?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DavError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Api { status, body })
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DavError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl DavError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DavError::Api { status, .. } => Some(*status),
            DavError::Request(err) => err.status(),
            DavError::Url(_) => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            DavError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        self.classification() == Some(ApiErrorClass::Conflict)
    }

    pub fn is_locked(&self) -> bool {
        self.classification() == Some(ApiErrorClass::Locked)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorClass::NotFound
    } else if matches!(
        status,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
    ) {
        ApiErrorClass::Conflict
    } else if status == StatusCode::LOCKED {
        ApiErrorClass::Locked
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteItem {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub lock: Option<LockInfo>,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Exclusive,
    Shared,
}

impl LockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockScope::Exclusive => "exclusive",
            LockScope::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LockInfo {
    /// Empty when the server withholds another principal's token.
    #[serde(default)]
    pub token: String,
    pub owner: String,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub expires_at: Option<String>,
}

fn default_exclusive() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChildrenPage {
    pub items: Vec<RemoteItem>,
    pub total: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Deserialize)]
struct WriteResult {
    #[serde(default)]
    etag: Option<String>,
}

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::client::DavClient;

#[derive(Debug, Error)]
pub enum ChangeFeedError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("change feed returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed change message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("move notification for {0} has no target path")]
    MissingTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Moved,
    Locked,
    Unlocked,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "created" => Some(ChangeKind::Created),
            "updated" => Some(ChangeKind::Updated),
            "deleted" => Some(ChangeKind::Deleted),
            "moved" => Some(ChangeKind::Moved),
            "locked" => Some(ChangeKind::Locked),
            "unlocked" => Some(ChangeKind::Unlocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Moved => "moved",
            ChangeKind::Locked => "locked",
            ChangeKind::Unlocked => "unlocked",
        }
    }
}

/// One remote change notification. `target` is set only for moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub target: Option<String>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            target: None,
        }
    }

    pub fn moved(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Moved,
            path: from.into(),
            target: Some(to.into()),
        }
    }

    /// Parses one feed line. Blank lines and unknown event types yield `None`.
    pub fn from_line(line: &str) -> Result<Option<Self>, ChangeFeedError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let message: ChangeMessage = serde_json::from_str(line)?;
        let Some(kind) = ChangeKind::parse(&message.event_type) else {
            return Ok(None);
        };
        let target = message.target_path.filter(|target| !target.is_empty());
        if kind == ChangeKind::Moved && target.is_none() {
            return Err(ChangeFeedError::MissingTarget(message.item_path));
        }
        Ok(Some(Self {
            kind,
            path: message.item_path,
            target: if kind == ChangeKind::Moved { target } else { None },
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ChangeMessage {
    #[serde(rename = "EventType", alias = "eventType", alias = "event_type")]
    event_type: String,
    #[serde(rename = "ItemPath", alias = "itemPath", alias = "item_path")]
    item_path: String,
    #[serde(
        rename = "TargetPath",
        alias = "targetPath",
        alias = "target_path",
        default
    )]
    target_path: Option<String>,
}

/// Something that can open a change notification channel.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChangeConnection>, ChangeFeedError>;
}

/// An open channel. `Ok(None)` means the server closed it.
#[async_trait]
pub trait ChangeConnection: Send {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, ChangeFeedError>;
}

/// Streaming NDJSON change feed at `<base>/v1/changes`.
#[derive(Clone)]
pub struct ChangeFeed {
    client: DavClient,
    url: Url,
}

impl ChangeFeed {
    pub fn new(client: DavClient) -> Result<Self, ChangeFeedError> {
        let url = client.base_url().join("v1/changes")?;
        Ok(Self { client, url })
    }

    /// Uses a feed endpoint hosted separately from the item API.
    pub fn with_url(client: DavClient, url: &str) -> Result<Self, ChangeFeedError> {
        Ok(Self {
            client,
            url: Url::parse(url)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn open(&self) -> Result<ChangeStream, ChangeFeedError> {
        let response = self
            .client
            .request(Method::GET, self.url.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChangeFeedError::Status { status, body });
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(ChangeStream {
            stream,
            buffer: Vec::new(),
            finished: false,
        })
    }
}

#[async_trait]
impl ChangeSource for ChangeFeed {
    async fn connect(&self) -> Result<Box<dyn ChangeConnection>, ChangeFeedError> {
        Ok(Box::new(self.open().await?))
    }
}

pub struct ChangeStream {
    stream: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl ChangeStream {
    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn parse(line: &str) -> Option<ChangeEvent> {
        match ChangeEvent::from_line(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "skipping change message");
                None
            }
        }
    }
}

#[async_trait]
impl ChangeConnection for ChangeStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, ChangeFeedError> {
        loop {
            if let Some(line) = self.take_line() {
                if let Some(event) = Self::parse(&line) {
                    return Ok(Some(event));
                }
                continue;
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Self::parse(&String::from_utf8_lossy(&rest)));
            }
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.finished = true,
            }
        }
    }
}

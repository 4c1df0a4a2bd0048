use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Url;
use tracing::debug;

use crate::error::LoadError;

/// Where the engine module lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// Fetched with an HTTP GET.
    Url(Url),
    /// Read from the local filesystem.
    Path(PathBuf),
}

impl FromStr for ModuleSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("module source must not be empty".to_string());
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Url::parse(s)
                .map(ModuleSource::Url)
                .map_err(|err| format!("invalid module url {s:?}: {err}"));
        }
        let path = s.strip_prefix("file://").unwrap_or(s);
        Ok(ModuleSource::Path(PathBuf::from(path)))
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Url(url) => write!(f, "{url}"),
            ModuleSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Module bytes as delivered by a fetcher.
pub enum ModuleBody {
    /// The whole module in memory.
    Buffered(Bytes),
    /// The module as a chunk stream, for runtimes that compile while downloading.
    Streaming(BoxStream<'static, Result<Bytes, LoadError>>),
}

impl ModuleBody {
    /// Collect the body into one buffer.
    pub async fn into_bytes(self) -> Result<Bytes, LoadError> {
        match self {
            ModuleBody::Buffered(bytes) => Ok(bytes),
            ModuleBody::Streaming(mut chunks) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = chunks.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for ModuleBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            ModuleBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Retrieves the engine module.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    /// Fetch the module. Non-success responses are hard failures.
    async fn fetch(&self) -> Result<ModuleBody, LoadError>;
}

/// GETs the module from a fixed URL.
pub struct HttpModuleFetcher {
    http: reqwest::Client,
    url: Url,
}

impl HttpModuleFetcher {
    /// Fetcher with its own client bounded by `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, LoadError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LoadError::Fetch(format!("{err:#}")))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ModuleFetcher for HttpModuleFetcher {
    async fn fetch(&self) -> Result<ModuleBody, LoadError> {
        debug!(url = %self.url, "fetching engine module");
        let res = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(|err| LoadError::Fetch(format!("{err:#}")))?;

        if !res.status().is_success() {
            return Err(LoadError::Http {
                status: res.status().as_u16(),
            });
        }

        let chunks = res
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| LoadError::Fetch(format!("{err:#}"))))
            .boxed();
        Ok(ModuleBody::Streaming(chunks))
    }
}

/// Reads the module from disk.
pub struct FileModuleFetcher {
    path: PathBuf,
}

impl FileModuleFetcher {
    /// Fetcher for `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ModuleFetcher for FileModuleFetcher {
    async fn fetch(&self) -> Result<ModuleBody, LoadError> {
        debug!(path = %self.path.display(), "reading engine module");
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| LoadError::Fetch(format!("{}: {err}", self.path.display())))?;
        Ok(ModuleBody::Buffered(Bytes::from(bytes)))
    }
}

/// Build the fetcher matching `source`.
pub fn fetcher_for(
    source: &ModuleSource,
    timeout: Duration,
) -> Result<Arc<dyn ModuleFetcher>, LoadError> {
    Ok(match source {
        ModuleSource::Url(url) => Arc::new(HttpModuleFetcher::new(url.clone(), timeout)?),
        ModuleSource::Path(path) => Arc::new(FileModuleFetcher::new(path.clone())),
    })
}

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{url} is larger than {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("unsupported image url: {0}")]
    Unsupported(String),
}

/// Fetch-by-url capability for candidate images.
#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

pub const MAX_IMAGE_BYTES: usize = 40 * 1024 * 1024;

/// Fetches `http(s)://` urls with reqwest and `file://` urls (or bare absolute
/// paths) from local disk.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nazr-facefind/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, max_bytes: MAX_IMAGE_BYTES })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    async fn fetch_http(&self, url: &str) -> Result<Bytes, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport { url: url.to_string(), source })?;
        if !response.status().is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: response.status().as_u16() });
        }
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(FetchError::TooLarge { url: url.to_string(), limit: self.max_bytes });
            }
        }
        // Content-Length may be absent or wrong, so the cap is enforced while reading.
        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| FetchError::Transport { url: url.to_string(), source })?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge { url: url.to_string(), limit: self.max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    async fn fetch_file(&self, url: &str, path: PathBuf) -> Result<Bytes, FetchError> {
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|source| FetchError::Io { path: path.clone(), source })?;
        if meta.len() as usize > self.max_bytes {
            return Err(FetchError::TooLarge { url: url.to_string(), limit: self.max_bytes });
        }
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| FetchError::Io { path, source })?;
        Ok(Bytes::from(data))
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url).await
        } else if let Some(path) = url.strip_prefix("file://") {
            self.fetch_file(url, PathBuf::from(path)).await
        } else if url.starts_with('/') {
            self.fetch_file(url, PathBuf::from(url)).await
        } else {
            Err(FetchError::Unsupported(url.to_string()))
        }
    }
}

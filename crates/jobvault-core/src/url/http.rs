use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{BoxAsyncRead, Url, UrlAccess};
use crate::error::{StoreError, StoreResult};

/// `http:` and `https:` URLs. Export uses `PUT`.
#[derive(Debug, Clone)]
pub struct HttpAccess {
    client: Client,
}

impl Default for HttpAccess {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpAccess {
    /// Create a handler whose connections time out after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self { client }
    }
}

fn status_error(url: &Url, status: StatusCode) -> StoreError {
    if status == StatusCode::NOT_FOUND {
        StoreError::NoSuchFile(url.to_string())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::Transient(format!("{url}: HTTP {status}"))
    } else {
        StoreError::Backend(format!("{url}: HTTP {status}"))
    }
}

#[async_trait]
impl UrlAccess for HttpAccess {
    fn schemes(&self) -> &[&'static str] {
        &["http", "https"]
    }

    async fn exists(&self, url: &Url) -> StoreResult<bool> {
        let response = self.client.head(url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(url, s)),
        }
    }

    async fn open_read(&self, url: &Url) -> StoreResult<BoxAsyncRead> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(status_error(url, response.status()));
        }
        tracing::debug!(url = %url, length = ?response.content_length(), "Streaming HTTP download");
        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }

    async fn write_from(&self, url: &Url, content: BoxAsyncRead) -> StoreResult<u64> {
        let written = Arc::new(AtomicU64::new(0));
        let counter = written.clone();
        let body = ReaderStream::new(content).inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });
        let response = self
            .client
            .put(url.clone())
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(url, response.status()));
        }
        Ok(written.load(Ordering::Relaxed))
    }
}

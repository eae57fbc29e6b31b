//! External URL access for import and export.
//!
//! A [`UrlRegistry`] dispatches on the URL scheme to a [`UrlAccess`]
//! handler. The default registry knows `file`, `http`, `https` and `ftp`;
//! backends add handlers for their native schemes with
//! [`UrlRegistry::with_handler`].

mod ftp;
mod http;
mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{StoreError, StoreResult};

pub use ftp::FtpAccess;
pub use http::HttpAccess;
pub use local::LocalFileAccess;
pub use reqwest::Url;

/// A boxed byte source handed between URL handlers and stores.
pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;

/// Read and write access to content addressed by URL.
#[async_trait]
pub trait UrlAccess: Send + Sync {
    /// Schemes this handler serves.
    fn schemes(&self) -> &[&'static str];

    /// Whether the URL names existing content.
    async fn exists(&self, url: &Url) -> StoreResult<bool>;

    /// Open the content for reading. Fails with `NoSuchFile` if absent.
    async fn open_read(&self, url: &Url) -> StoreResult<BoxAsyncRead>;

    /// Replace the content at `url` with everything read from `content`.
    /// Returns the number of bytes written.
    async fn write_from(&self, url: &Url, content: BoxAsyncRead) -> StoreResult<u64>;
}

/// Scheme-to-handler table.
#[derive(Clone)]
pub struct UrlRegistry {
    handlers: Vec<Arc<dyn UrlAccess>>,
}

impl Default for UrlRegistry {
    fn default() -> Self {
        Self::empty()
            .with_handler(Arc::new(LocalFileAccess))
            .with_handler(Arc::new(HttpAccess::default()))
            .with_handler(Arc::new(FtpAccess::default()))
    }
}

impl std::fmt::Debug for UrlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schemes: Vec<&str> = self
            .handlers
            .iter()
            .flat_map(|h| h.schemes().iter().copied())
            .collect();
        f.debug_struct("UrlRegistry").field("schemes", &schemes).finish()
    }
}

impl UrlRegistry {
    /// A registry without any handlers.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler. Later handlers win for schemes served twice.
    pub fn with_handler(mut self, handler: Arc<dyn UrlAccess>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Handler for a URL's scheme.
    pub fn handler(&self, url: &Url) -> StoreResult<&dyn UrlAccess> {
        self.handlers
            .iter()
            .rev()
            .find(|h| h.schemes().contains(&url.scheme()))
            .map(|h| h.as_ref())
            .ok_or_else(|| StoreError::UnsupportedUrl(url.to_string()))
    }

    pub async fn exists(&self, url: &Url) -> StoreResult<bool> {
        self.handler(url)?.exists(url).await
    }

    pub async fn open_read(&self, url: &Url) -> StoreResult<BoxAsyncRead> {
        self.handler(url)?.open_read(url).await
    }

    pub async fn write_from(&self, url: &Url, content: BoxAsyncRead) -> StoreResult<u64> {
        self.handler(url)?.write_from(url, content).await
    }
}

/// Parse an import/export target. Absolute local paths become `file:` URLs.
pub fn parse_url(target: &str) -> StoreResult<Url> {
    if target.starts_with('/') {
        return Url::from_file_path(Path::new(target))
            .map_err(|()| StoreError::UnsupportedUrl(target.to_string()));
    }
    Url::parse(target).map_err(|e| StoreError::UnsupportedUrl(format!("{target}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paths_and_urls() {
        let url = parse_url("/tmp/some file.txt").unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.to_file_path().unwrap(), Path::new("/tmp/some file.txt"));

        let url = parse_url("ftp://user:pw@localhost:2121/a/b.bin").unwrap();
        assert_eq!(url.scheme(), "ftp");
        assert_eq!(url.port(), Some(2121));

        assert!(matches!(
            parse_url("relative/path"),
            Err(StoreError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_unknown_scheme_is_unsupported() {
        let registry = UrlRegistry::default();
        let url = parse_url("gopher://example.org/x").unwrap();
        assert!(matches!(
            registry.handler(&url),
            Err(StoreError::UnsupportedUrl(_))
        ));
        let url = parse_url("https://example.org/x").unwrap();
        assert_eq!(registry.handler(&url).unwrap().schemes(), &["http", "https"]);
    }
}

//! Native object URLs (`<scheme>://<container>/<key>`) for import and export.

use std::sync::Arc;

use async_trait::async_trait;
use jobvault_core::config::DEFAULT_PART_SIZE;
use jobvault_core::stream::{READ_CHUNK_SIZE, WriteOptions};
use jobvault_core::url::{BoxAsyncRead, Url, UrlAccess};
use jobvault_core::{ReadHandle, RetryPolicy, StoreError, StoreResult, WriteHandle};

use crate::backend::ObjectBackend;
use crate::content::{BlobSource, Blobs, ObjectSink};

/// Reads and writes objects of a backend by URL.
pub struct ObjectUrlAccess<B> {
    backend: Arc<B>,
    retry: RetryPolicy,
    part_size: u64,
}

impl<B: ObjectBackend> ObjectUrlAccess<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    fn locate(&self, url: &Url) -> StoreResult<(Blobs<B>, String)> {
        let container = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StoreError::UnsupportedUrl(format!("{url}: missing container")))?;
        let key = url.path().trim_start_matches('/');
        if key.is_empty() {
            return Err(StoreError::UnsupportedUrl(format!("{url}: missing key")));
        }
        let blobs = Blobs::new(self.backend.clone(), container.to_string(), self.retry);
        Ok((blobs, key.to_string()))
    }
}

fn missing_as_file(url: &Url, e: StoreError) -> StoreError {
    match e {
        StoreError::NoSuchJobStore(_) | StoreError::NoSuchFile(_) => {
            StoreError::NoSuchFile(url.to_string())
        }
        other => other,
    }
}

#[async_trait]
impl<B: ObjectBackend> UrlAccess for ObjectUrlAccess<B> {
    fn schemes(&self) -> &[&'static str] {
        self.backend.url_schemes()
    }

    async fn exists(&self, url: &Url) -> StoreResult<bool> {
        let (blobs, key) = self.locate(url)?;
        match blobs.head(&key).await {
            Ok(meta) => Ok(meta.is_some()),
            Err(StoreError::NoSuchJobStore(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn open_read(&self, url: &Url) -> StoreResult<BoxAsyncRead> {
        let (blobs, key) = self.locate(url)?;
        let meta = blobs
            .head(&key)
            .await
            .map_err(|e| missing_as_file(url, e))?
            .ok_or_else(|| StoreError::NoSuchFile(url.to_string()))?;
        if meta.sse_fingerprint.is_some() {
            return Err(StoreError::Encryption(format!(
                "{url} is server-side encrypted with a customer key"
            )));
        }
        let source = BlobSource::new(blobs, key, None, meta.size, READ_CHUNK_SIZE as u64);
        let reader = ReadHandle::spawn(Box::new(source), jobvault_core::crypto::Opener::new(None));
        Ok(Box::new(reader))
    }

    async fn write_from(&self, url: &Url, mut content: BoxAsyncRead) -> StoreResult<u64> {
        let (blobs, key) = self.locate(url)?;
        let sink = ObjectSink::new(blobs, key, None, None);
        let mut writer = WriteHandle::spawn(
            Box::new(sink),
            WriteOptions {
                part_size: self.part_size,
                sealer: None,
                label: url.to_string(),
            },
        );
        if let Err(e) = tokio::io::copy(&mut content, &mut writer).await {
            let e = StoreError::from(e);
            if matches!(e, StoreError::StreamAborted(_)) {
                // The upload task has stopped; its result carries the cause.
                writer.commit().await.map_err(|e| missing_as_file(url, e))?;
            }
            return Err(missing_as_file(url, e));
        }
        let summary = writer.commit().await.map_err(|e| missing_as_file(url, e))?;
        Ok(summary.size)
    }
}

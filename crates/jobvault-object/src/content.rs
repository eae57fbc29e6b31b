//! Container handles, upload sinks and download sources.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use jobvault_core::file::should_inline;
use jobvault_core::{
    ContentSink, ContentSource, EncryptionKey, FileRecord, RetryPolicy, StoreError, StoreResult,
    StoredContent, UploadSummary, retry_transient,
};

use crate::backend::{ListPage, ObjectBackend, ObjectMeta, Precondition, PutOptions};

/// One container of a backend, with every call retried on transient errors.
pub(crate) struct Blobs<B> {
    backend: Arc<B>,
    container: String,
    retry: RetryPolicy,
}

impl<B> Clone for Blobs<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            container: self.container.clone(),
            retry: self.retry,
        }
    }
}

impl<B: ObjectBackend> Blobs<B> {
    pub(crate) fn new(backend: Arc<B>, container: String, retry: RetryPolicy) -> Self {
        Self {
            backend,
            container,
            retry,
        }
    }

    pub(crate) fn container(&self) -> &str {
        &self.container
    }

    pub(crate) async fn create(&self) -> StoreResult<()> {
        retry_transient(&self.retry, "create_container", || {
            self.backend.create_container(&self.container)
        })
        .await
    }

    pub(crate) async fn exists(&self) -> StoreResult<bool> {
        retry_transient(&self.retry, "container_exists", || {
            self.backend.container_exists(&self.container)
        })
        .await
    }

    pub(crate) async fn destroy(&self) -> StoreResult<()> {
        retry_transient(&self.retry, "delete_container", || {
            self.backend.delete_container(&self.container)
        })
        .await
    }

    pub(crate) async fn put(
        &self,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<ObjectMeta> {
        retry_transient(&self.retry, "put", || {
            self.backend.put(&self.container, key, data.clone(), options)
        })
        .await
    }

    pub(crate) async fn get(
        &self,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<(Bytes, ObjectMeta)> {
        retry_transient(&self.retry, "get", || self.backend.get(&self.container, key, sse)).await
    }

    /// Like [`get`](Self::get), with a missing key reported as `None`.
    pub(crate) async fn get_optional(&self, key: &str) -> StoreResult<Option<(Bytes, ObjectMeta)>> {
        match self.get(key, None).await {
            Ok(found) => Ok(Some(found)),
            Err(StoreError::NoSuchFile(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn get_range(
        &self,
        key: &str,
        range: Range<u64>,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<Bytes> {
        retry_transient(&self.retry, "get_range", || {
            self.backend
                .get_range(&self.container, key, range.clone(), sse)
        })
        .await
    }

    pub(crate) async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        retry_transient(&self.retry, "head", || self.backend.head(&self.container, key)).await
    }

    pub(crate) async fn delete(&self, key: &str) -> StoreResult<()> {
        retry_transient(&self.retry, "delete", || self.backend.delete(&self.container, key)).await
    }

    /// Delete, logging instead of failing. Used for garbage left behind by
    /// a replacement that already succeeded.
    pub(crate) async fn delete_quietly(&self, key: &str) {
        if let Err(e) = self.delete(key).await {
            tracing::warn!(container = %self.container, key, error = %e, "Failed to delete stale object");
        }
    }

    pub(crate) async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        retry_transient(&self.retry, "list", || self.backend.list(&self.container, prefix)).await
    }

    pub(crate) async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        retry_transient(&self.retry, "list", || {
            self.backend
                .list_page(&self.container, prefix, start_after, limit)
        })
        .await
    }

    pub(crate) async fn public_url(&self, key: &str) -> StoreResult<String> {
        retry_transient(&self.retry, "public_url", || {
            self.backend.public_url(&self.container, key)
        })
        .await
    }

    async fn create_multipart(&self, key: &str, sse: Option<&EncryptionKey>) -> StoreResult<String> {
        retry_transient(&self.retry, "create_multipart", || {
            self.backend.create_multipart(&self.container, key, sse)
        })
        .await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Bytes,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String> {
        retry_transient(&self.retry, "upload_part", || {
            self.backend
                .upload_part(&self.container, key, upload_id, number, data.clone(), sse)
        })
        .await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> StoreResult<ObjectMeta> {
        retry_transient(&self.retry, "complete_multipart", || {
            self.backend
                .complete_multipart(&self.container, key, upload_id, parts.to_vec())
        })
        .await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        retry_transient(&self.retry, "abort_multipart", || {
            self.backend.abort_multipart(&self.container, key, upload_id)
        })
        .await
    }
}

/// How a finished upload's record is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordMode {
    /// A brand-new file; the record must not exist yet.
    Create,
    /// Replace the current record, whatever its version.
    Replace {
        /// Fail with `NoSuchFile` if the record is gone.
        must_exist: bool,
    },
}

/// The file record an upload publishes once its content is stored.
pub(crate) struct PendingRecord<B> {
    pub(crate) records: Blobs<B>,
    pub(crate) key: String,
    pub(crate) template: FileRecord,
    pub(crate) mode: RecordMode,
    pub(crate) inline_threshold: u64,
}

impl<B: ObjectBackend> PendingRecord<B> {
    /// Write the record pointing at `content`. Returns the content key of
    /// the version it replaced, if any.
    async fn publish(&self, content: &StoredContent) -> StoreResult<Option<String>> {
        let mut record = self.template.clone();
        record.content = content.clone();
        record.modified_at = chrono::Utc::now();
        loop {
            let (precondition, replaced) = match self.mode {
                RecordMode::Create => (Precondition::IfAbsent, None),
                RecordMode::Replace { must_exist } => match self.records.get_optional(&self.key).await? {
                    Some((raw, meta)) => {
                        let current: FileRecord = serde_json::from_slice(&raw)?;
                        record.version = current.version + 1;
                        let replaced = match current.content {
                            StoredContent::Blob { key, .. } => Some(key),
                            StoredContent::Inline { .. } => None,
                        };
                        (Precondition::IfVersion(meta.version), replaced)
                    }
                    None if must_exist => {
                        return Err(StoreError::NoSuchFile(record.id.to_string()));
                    }
                    None => (Precondition::IfAbsent, None),
                },
            };
            let options = PutOptions {
                precondition,
                sse: None,
            };
            let raw = Bytes::from(serde_json::to_vec(&record)?);
            match self.records.put(&self.key, raw, &options).await {
                Ok(_) => return Ok(replaced),
                Err(StoreError::PreconditionFailed(_)) if self.mode != RecordMode::Create => {
                    tracing::debug!(record = %self.key, "File record changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Uploads a stream into one object, then optionally publishes a record.
///
/// Small content of a recorded upload is inlined into the record instead
/// of becoming an object.
pub(crate) struct ObjectSink<B> {
    blobs: Blobs<B>,
    key: String,
    sse: Option<EncryptionKey>,
    upload: Option<(String, Vec<(u32, String)>)>,
    record: Option<PendingRecord<B>>,
}

impl<B: ObjectBackend> ObjectSink<B> {
    pub(crate) fn new(
        blobs: Blobs<B>,
        key: String,
        sse: Option<EncryptionKey>,
        record: Option<PendingRecord<B>>,
    ) -> Self {
        Self {
            blobs,
            key,
            sse,
            upload: None,
            record,
        }
    }

    async fn store(&mut self, tail: Bytes, summary: &UploadSummary) -> StoreResult<StoredContent> {
        let inline = self.upload.is_none()
            && self.sse.is_none()
            && self.record.as_ref().is_some_and(|r| {
                should_inline(summary.stored_size, r.inline_threshold, r.template.public)
            });
        if inline {
            return Ok(StoredContent::Inline {
                data: tail.to_vec(),
            });
        }
        let parts = match self.upload.take() {
            Some((upload_id, mut parts)) => {
                let number = parts.len() as u32 + 1;
                let tag = self
                    .blobs
                    .upload_part(&self.key, &upload_id, number, tail, self.sse.as_ref())
                    .await;
                let completed = match tag {
                    Ok(tag) => {
                        parts.push((number, tag));
                        self.blobs
                            .complete_multipart(&self.key, &upload_id, &parts)
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = completed {
                    let _ = self.blobs.abort_multipart(&self.key, &upload_id).await;
                    return Err(e);
                }
                number
            }
            None => {
                let options = PutOptions::default().with_sse(self.sse.clone());
                self.blobs.put(&self.key, tail, &options).await?;
                1
            }
        };
        Ok(StoredContent::Blob {
            key: self.key.clone(),
            stored_size: summary.stored_size,
            parts,
        })
    }
}

#[async_trait]
impl<B: ObjectBackend> ContentSink for ObjectSink<B> {
    async fn put_part(&mut self, index: u32, part: Bytes) -> StoreResult<()> {
        let upload_id = match &self.upload {
            Some((upload_id, _)) => upload_id.clone(),
            None => {
                let upload_id = self
                    .blobs
                    .create_multipart(&self.key, self.sse.as_ref())
                    .await?;
                self.upload = Some((upload_id.clone(), Vec::new()));
                upload_id
            }
        };
        let number = index + 1;
        let tag = self
            .blobs
            .upload_part(&self.key, &upload_id, number, part, self.sse.as_ref())
            .await?;
        if let Some((_, parts)) = &mut self.upload {
            parts.push((number, tag));
        }
        Ok(())
    }

    async fn complete(mut self: Box<Self>, tail: Bytes, summary: UploadSummary) -> StoreResult<()> {
        let content = self.store(tail, &summary).await?;
        let Some(pending) = self.record.take() else {
            return Ok(());
        };

        let mut template = pending.template.clone();
        template.summary = summary.content.clone();
        template.client_encrypted = summary.client_encrypted;
        template.sse_fingerprint = match &content {
            StoredContent::Blob { .. } => self.sse.as_ref().map(EncryptionKey::fingerprint),
            StoredContent::Inline { .. } => None,
        };
        let pending = PendingRecord { template, ..pending };

        match pending.publish(&content).await {
            Ok(replaced) => {
                if let Some(old) = replaced.filter(|old| *old != self.key) {
                    self.blobs.delete_quietly(&old).await;
                }
                tracing::debug!(
                    record = %pending.key,
                    size = summary.content.size,
                    inline = content.is_inline(),
                    "Stored file content"
                );
                Ok(())
            }
            Err(e) => {
                // Public content sits under a stable key shared by all versions.
                if let StoredContent::Blob { key, .. } = &content {
                    if !pending.template.public {
                        self.blobs.delete_quietly(key).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn abort(self: Box<Self>) {
        if let Some((upload_id, _)) = &self.upload {
            if let Err(e) = self.blobs.abort_multipart(&self.key, upload_id).await {
                tracing::warn!(key = %self.key, error = %e, "Failed to abort multipart upload");
            }
        }
    }
}

/// Reads an object in ranged chunks.
pub(crate) struct BlobSource<B> {
    blobs: Blobs<B>,
    key: String,
    sse: Option<EncryptionKey>,
    offset: u64,
    size: u64,
    chunk: u64,
}

impl<B: ObjectBackend> BlobSource<B> {
    pub(crate) fn new(
        blobs: Blobs<B>,
        key: String,
        sse: Option<EncryptionKey>,
        size: u64,
        chunk: u64,
    ) -> Self {
        Self {
            blobs,
            key,
            sse,
            offset: 0,
            size,
            chunk: chunk.max(1),
        }
    }
}

#[async_trait]
impl<B: ObjectBackend> ContentSource for BlobSource<B> {
    async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        if self.offset >= self.size {
            return Ok(None);
        }
        let end = (self.offset + self.chunk).min(self.size);
        let data = self
            .blobs
            .get_range(&self.key, self.offset..end, self.sse.as_ref())
            .await?;
        if data.is_empty() {
            return Err(StoreError::Backend(format!(
                "{} ended at {} of {} bytes",
                self.key, self.offset, self.size
            )));
        }
        self.offset += data.len() as u64;
        Ok(Some(data))
    }
}

//! File-backed content sinks and sources.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use jobvault_core::stream::READ_CHUNK_SIZE;
use jobvault_core::{ContentSink, ContentSource, StoreError, StoreResult, UploadSummary};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::layout::temp_sibling;

/// Write `data` to `path` through a temporary sibling and an atomic rename.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = temp_sibling(path);
    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Streams an upload into a temporary sibling of `target` and renames it
/// into place on completion, so readers only ever see whole versions.
pub(crate) struct FileSink {
    target: PathBuf,
    tmp: PathBuf,
    file: fs::File,
    /// Directory created for a new file, removed again on abort.
    created_dir: Option<PathBuf>,
    /// Report a vanished target directory as this missing file.
    missing_as: String,
    /// The target must still exist when the upload completes.
    must_exist: bool,
}

impl FileSink {
    /// Sink for a brand-new file; its parent directory is created here.
    pub(crate) async fn create_new(target: PathBuf, missing_as: String) -> StoreResult<Self> {
        let dir = target
            .parent()
            .ok_or_else(|| StoreError::Internal(format!("{} has no parent", target.display())))?
            .to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| missing(e, &missing_as))?;
        let mut sink = Self::open(target, missing_as).await?;
        sink.created_dir = Some(dir);
        Ok(sink)
    }

    /// Sink replacing an existing file. Fails with `NoSuchFile` on completion
    /// if the file was deleted while the upload was running.
    pub(crate) async fn replace(target: PathBuf, missing_as: String) -> StoreResult<Self> {
        let mut sink = Self::open(target, missing_as).await?;
        sink.must_exist = true;
        Ok(sink)
    }

    /// Sink creating or replacing a file.
    pub(crate) async fn open(target: PathBuf, missing_as: String) -> StoreResult<Self> {
        let tmp = temp_sibling(&target);
        let file = fs::File::create(&tmp)
            .await
            .map_err(|e| missing(e, &missing_as))?;
        Ok(Self {
            target,
            tmp,
            file,
            created_dir: None,
            missing_as,
            must_exist: false,
        })
    }

    async fn discard(tmp: &Path, created_dir: Option<&Path>) {
        let _ = fs::remove_file(tmp).await;
        if let Some(dir) = created_dir {
            let _ = fs::remove_dir(dir).await;
        }
    }
}

fn missing(e: std::io::Error, what: &str) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NoSuchFile(what.to_string())
    } else {
        e.into()
    }
}

#[async_trait]
impl ContentSink for FileSink {
    async fn put_part(&mut self, _index: u32, part: Bytes) -> StoreResult<()> {
        self.file.write_all(&part).await?;
        Ok(())
    }

    async fn complete(self: Box<Self>, tail: Bytes, summary: UploadSummary) -> StoreResult<()> {
        let Self {
            target,
            tmp,
            mut file,
            created_dir,
            missing_as,
            must_exist,
        } = *self;
        let finished = async {
            file.write_all(&tail).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            if must_exist && !fs::try_exists(&target).await? {
                // Deleted mid-upload; the temp file was all that kept its
                // directory alive.
                let _ = fs::remove_file(&tmp).await;
                if let Some(dir) = target.parent() {
                    let _ = fs::remove_dir(dir).await;
                }
                return Err(StoreError::NoSuchFile(missing_as.clone()));
            }
            fs::rename(&tmp, &target)
                .await
                .map_err(|e| missing(e, &missing_as))
        }
        .await;
        if let Err(e) = finished {
            Self::discard(&tmp, created_dir.as_deref()).await;
            return Err(e);
        }
        tracing::debug!(
            path = %target.display(),
            size = summary.content.size,
            stored = summary.stored_size,
            "Stored file content"
        );
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let Self {
            tmp,
            file,
            created_dir,
            ..
        } = *self;
        drop(file);
        Self::discard(&tmp, created_dir.as_deref()).await;
    }
}

/// Reads a stored file in fixed-size chunks.
pub(crate) struct FileSource {
    file: fs::File,
}

impl FileSource {
    pub(crate) async fn open(path: &Path, missing_as: &str) -> StoreResult<Self> {
        let file = fs::File::open(path).await.map_err(|e| missing(e, missing_as))?;
        Ok(Self { file })
    }
}

#[async_trait]
impl ContentSource for FileSource {
    async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

/// First bytes of a file, used to recognise envelopes.
pub(crate) async fn read_prefix(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let file = fs::File::open(path).await?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

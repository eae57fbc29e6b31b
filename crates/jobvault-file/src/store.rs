//! Directory-backed job store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use jobvault_core::crypto::{ENVELOPE_MAGIC, EncryptionKey, Opener, Sealer};
use jobvault_core::store::validate_shared_name;
use jobvault_core::stream::WriteOptions;
use jobvault_core::url::Url;
use jobvault_core::{
    FileId, JobBatch, JobDescription, JobId, JobNode, JobStore, KeyRing, ReadHandle, StoreConfig,
    StoreError, StoreResult, UrlRegistry, WriteHandle,
};
use tokio::fs;

use crate::content::{FileSink, FileSource, read_prefix, write_atomic};
use crate::layout::{Layout, STATS_NEW, STATS_READ, STREAM_NAME, basename};

/// Config and keys of an attached handle.
struct Attached {
    config: StoreConfig,
    keys: KeyRing,
}

/// Job store keeping everything below one directory.
///
/// Job records are replaced by writing a temporary sibling and renaming it
/// over `job.json`, which makes `update` atomic to concurrent readers on any
/// POSIX filesystem, including ones shared between hosts.
///
/// The directory store has no server to hand a key to, so a configured
/// `sse_key` is applied as an in-process envelope just like `cse_key`
/// (which takes precedence when both are set).
pub struct FileJobStore {
    layout: Layout,
    urls: Arc<UrlRegistry>,
    attached: Option<Attached>,
}

impl std::fmt::Debug for FileJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJobStore")
            .field("root", &self.layout.root())
            .field("attached", &self.attached.is_some())
            .finish()
    }
}

impl FileJobStore {
    /// Create a detached handle for the store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = std::path::absolute(root.as_ref())?;
        Ok(Self {
            layout: Layout::new(root),
            urls: Arc::new(UrlRegistry::default()),
            attached: None,
        })
    }

    /// Use a shared URL registry for import and export.
    pub fn with_url_registry(mut self, urls: Arc<UrlRegistry>) -> Self {
        self.urls = urls;
        self
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    fn attached(&self) -> StoreResult<&Attached> {
        self.attached
            .as_ref()
            .ok_or_else(|| StoreError::NotAttached(self.locator()))
    }

    fn envelope_key(&self) -> StoreResult<Option<&EncryptionKey>> {
        let keys = &self.attached()?.keys;
        Ok(keys.cse.as_ref().or(keys.sse.as_ref()))
    }

    fn write_options(&self, label: String, protected: bool) -> StoreResult<WriteOptions> {
        let attached = self.attached()?;
        let sealer = if protected {
            self.envelope_key()?.map(Sealer::new)
        } else {
            None
        };
        Ok(WriteOptions {
            part_size: attached.config.part_size,
            sealer,
            label,
        })
    }

    fn opener(&self) -> StoreResult<Opener> {
        Ok(Opener::new(self.envelope_key()?.cloned()))
    }

    async fn attach(&mut self, config: StoreConfig) -> StoreResult<()> {
        let keys = KeyRing::load(&config).await?;
        if keys.sse.is_some() && keys.cse.is_some() {
            tracing::warn!(
                root = %self.layout.root().display(),
                "Both sse_key and cse_key set; directory store envelopes with cse_key only"
            );
        }
        self.attached = Some(Attached { config, keys });
        Ok(())
    }

    async fn ensure_owner(&self, owner: Option<&JobId>) -> StoreResult<()> {
        if let Some(job) = owner {
            if !self.exists(job).await? {
                return Err(StoreError::NoSuchJob(job.to_string()));
            }
        }
        Ok(())
    }

    async fn new_file_writer(
        &self,
        owner: Option<&JobId>,
        name: &str,
    ) -> StoreResult<(WriteHandle, FileId)> {
        self.ensure_owner(owner).await?;
        let (id, path) = self.layout.new_file(owner, name)?;
        let options = self.write_options(id.to_string(), true)?;
        let sink = FileSink::create_new(path, id.to_string()).await?;
        Ok((WriteHandle::spawn(Box::new(sink), options), id))
    }

    /// Public `file:` URL of an existing, unenveloped file.
    async fn public_url_for(&self, path: &Path, missing_as: &str) -> StoreResult<String> {
        let prefix = match read_prefix(path, ENVELOPE_MAGIC.len()).await {
            Ok(prefix) => prefix,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchFile(missing_as.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if jobvault_core::crypto::is_enveloped(&prefix) {
            return Err(StoreError::Encryption(format!(
                "{missing_as} is encrypted and cannot be published"
            )));
        }
        Url::from_file_path(path)
            .map(|u| u.to_string())
            .map_err(|()| StoreError::Internal(format!("{} is not absolute", path.display())))
    }

    async fn stats_entries(&self) -> StoreResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(self.layout.stats_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some(STATS_NEW) | Some(STATS_READ)) && !is_temp(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}

enum JobCursor {
    Start(PathBuf),
    Listing(fs::ReadDir),
    Done,
}

#[async_trait]
impl JobStore for FileJobStore {
    fn locator(&self) -> String {
        format!("file:{}", self.layout.root().display())
    }

    fn url_registry(&self) -> &UrlRegistry {
        &self.urls
    }

    async fn initialize(&mut self, config: StoreConfig) -> StoreResult<()> {
        config.validate()?;
        let root = self.layout.root().to_path_buf();
        if fs::try_exists(self.layout.config_path()).await?
            || fs::try_exists(self.layout.jobs_dir()).await?
        {
            return Err(StoreError::JobStoreExists(self.locator()));
        }
        self.attach(config.clone()).await?;
        for dir in self.layout.skeleton() {
            fs::create_dir_all(&dir).await?;
        }
        write_atomic(&self.layout.config_path(), &serde_json::to_vec_pretty(&config)?).await?;
        tracing::info!(root = %root.display(), "Initialized directory job store");
        Ok(())
    }

    async fn resume(&mut self) -> StoreResult<()> {
        let raw = match fs::read(self.layout.config_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchJobStore(self.locator()));
            }
            Err(e) => return Err(e.into()),
        };
        let config: StoreConfig = serde_json::from_slice(&raw)?;
        self.attach(config).await?;
        tracing::info!(root = %self.layout.root().display(), "Resumed directory job store");
        Ok(())
    }

    async fn reconfigure(&mut self, config: StoreConfig) -> StoreResult<()> {
        self.attached()?;
        config.validate()?;
        self.attach(config.clone()).await?;
        write_atomic(&self.layout.config_path(), &serde_json::to_vec_pretty(&config)?).await
    }

    fn config(&self) -> StoreResult<&StoreConfig> {
        Ok(&self.attached()?.config)
    }

    async fn destroy(&self) -> StoreResult<()> {
        match fs::remove_dir_all(self.layout.root()).await {
            Ok(()) => {
                tracing::info!(root = %self.layout.root().display(), "Destroyed directory job store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn allocate_job_id(&self, _node: &JobNode) -> JobId {
        JobId::new(uuid::Uuid::new_v4().to_string())
    }

    async fn create_many(&self, jobs: Vec<JobDescription>) -> StoreResult<()> {
        self.attached()?;
        let writes = jobs.iter().map(|job| async move {
            let dir = self.layout.job_dir(&job.id)?;
            fs::create_dir_all(&dir).await?;
            write_atomic(&self.layout.job_record(&job.id)?, &serde_json::to_vec(job)?).await
        });
        futures::future::try_join_all(writes).await?;
        Ok(())
    }

    fn batch(&self) -> JobBatch<'_> {
        JobBatch::new(self)
    }

    async fn exists(&self, id: &JobId) -> StoreResult<bool> {
        match self.layout.job_record(id) {
            Ok(path) => Ok(fs::try_exists(path).await?),
            Err(_) => Ok(false),
        }
    }

    async fn load(&self, id: &JobId) -> StoreResult<JobDescription> {
        match fs::read(self.layout.job_record(id)?).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchJob(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, job: &JobDescription) -> StoreResult<()> {
        let path = self.layout.job_record(&job.id)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NoSuchJob(job.id.to_string()));
        }
        match write_atomic(&path, &serde_json::to_vec(job)?).await {
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchJob(job.id.to_string()))
            }
            other => other,
        }
    }

    async fn delete(&self, id: &JobId) -> StoreResult<()> {
        let dir = match self.layout.job_dir(id) {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };
        match self.load(id).await {
            Ok(job) => {
                for file_id in &job.files_to_delete {
                    self.delete_file(file_id).await?;
                }
            }
            Err(StoreError::NoSuchJob(_)) => {}
            Err(StoreError::Json(e)) => {
                tracing::warn!(job_id = %id, error = %e, "Deleting unreadable job record");
            }
            Err(e) => return Err(e),
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(job_id = %id, "Deleted job");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn jobs(&self) -> BoxStream<'_, StoreResult<JobDescription>> {
        let start = JobCursor::Start(self.layout.jobs_dir());
        futures::stream::unfold(start, move |mut cursor| async move {
            loop {
                match cursor {
                    JobCursor::Done => return None,
                    JobCursor::Start(dir) => match fs::read_dir(&dir).await {
                        Ok(entries) => cursor = JobCursor::Listing(entries),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
                        Err(e) => return Some((Err(e.into()), JobCursor::Done)),
                    },
                    JobCursor::Listing(mut entries) => match entries.next_entry().await {
                        Ok(None) => return None,
                        Ok(Some(entry)) => {
                            let id = JobId::new(entry.file_name().to_string_lossy());
                            match self.load(&id).await {
                                Ok(job) => return Some((Ok(job), JobCursor::Listing(entries))),
                                Err(StoreError::NoSuchJob(_)) => {
                                    cursor = JobCursor::Listing(entries);
                                }
                                Err(StoreError::Json(e)) => {
                                    tracing::warn!(job_id = %id, error = %e, "Skipping unparseable job record");
                                    cursor = JobCursor::Listing(entries);
                                }
                                Err(e) => return Some((Err(e), JobCursor::Listing(entries))),
                            }
                        }
                        Err(e) => return Some((Err(e.into()), JobCursor::Done)),
                    },
                }
            }
        })
        .boxed()
    }

    async fn get_empty_file_id(&self, owner: Option<&JobId>) -> StoreResult<FileId> {
        let (writer, id) = self.new_file_writer(owner, STREAM_NAME).await?;
        writer.commit().await?;
        Ok(id)
    }

    async fn write_file(&self, local_path: &Path, owner: Option<&JobId>) -> StoreResult<FileId> {
        let mut source = fs::File::open(local_path).await?;
        let (mut writer, id) = self
            .new_file_writer(owner, &basename(local_path))
            .await?;
        tokio::io::copy(&mut source, &mut writer).await?;
        writer.commit().await?;
        tracing::debug!(file_id = %id, "Wrote local file");
        Ok(id)
    }

    async fn write_file_stream(&self, owner: Option<&JobId>) -> StoreResult<(WriteHandle, FileId)> {
        self.new_file_writer(owner, STREAM_NAME).await
    }

    async fn read_file_stream(&self, id: &FileId) -> StoreResult<ReadHandle> {
        let path = self.layout.file_path(id)?;
        let source = FileSource::open(&path, id.as_str()).await?;
        Ok(ReadHandle::spawn(Box::new(source), self.opener()?))
    }

    async fn update_file_stream(&self, id: &FileId) -> StoreResult<WriteHandle> {
        let path = self.layout.file_path(id)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NoSuchFile(id.to_string()));
        }
        let options = self.write_options(id.to_string(), true)?;
        let sink = FileSink::replace(path, id.to_string()).await?;
        Ok(WriteHandle::spawn(Box::new(sink), options))
    }

    async fn delete_file(&self, id: &FileId) -> StoreResult<()> {
        let path = match self.layout.file_path(id) {
            Ok(path) => path,
            Err(_) => return Ok(()),
        };
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir(dir).await;
        }
        tracing::debug!(file_id = %id, "Deleted file");
        Ok(())
    }

    async fn file_exists(&self, id: &FileId) -> StoreResult<bool> {
        match self.layout.file_path(id) {
            Ok(path) => Ok(fs::metadata(&path).await.is_ok_and(|m| m.is_file())),
            Err(_) => Ok(false),
        }
    }

    async fn get_public_url(&self, id: &FileId) -> StoreResult<String> {
        let path = self.layout.file_path(id)?;
        self.public_url_for(&path, id.as_str()).await
    }

    async fn write_shared_file_stream(
        &self,
        name: &str,
        is_protected: bool,
    ) -> StoreResult<WriteHandle> {
        validate_shared_name(name)?;
        let options = self.write_options(format!("shared/{name}"), is_protected)?;
        fs::create_dir_all(self.layout.shared_dir()).await?;
        let sink = FileSink::open(self.layout.shared_path(name), name.to_string()).await?;
        Ok(WriteHandle::spawn(Box::new(sink), options))
    }

    async fn read_shared_file_stream(&self, name: &str) -> StoreResult<ReadHandle> {
        validate_shared_name(name).map_err(|_| StoreError::NoSuchFile(name.to_string()))?;
        let source = FileSource::open(&self.layout.shared_path(name), name).await?;
        Ok(ReadHandle::spawn(Box::new(source), self.opener()?))
    }

    async fn get_shared_public_url(&self, name: &str) -> StoreResult<String> {
        validate_shared_name(name).map_err(|_| StoreError::NoSuchFile(name.to_string()))?;
        self.public_url_for(&self.layout.shared_path(name), name).await
    }

    async fn write_stats_and_logging(&self, blob: Bytes) -> StoreResult<()> {
        let stored = match self.envelope_key()? {
            Some(key) => Sealer::seal_all(key, &blob)?,
            None => blob.to_vec(),
        };
        let name = format!(
            "{}-{}.{STATS_NEW}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.9f"),
            uuid::Uuid::new_v4().simple()
        );
        fs::create_dir_all(self.layout.stats_dir()).await?;
        write_atomic(&self.layout.stats_dir().join(name), &stored).await
    }

    async fn read_stats_and_logging(
        &self,
        callback: &mut (dyn FnMut(Bytes) + Send),
        read_all: bool,
    ) -> StoreResult<usize> {
        let key = self.envelope_key()?.cloned();
        let mut delivered = 0;
        for path in self.stats_entries().await? {
            let is_new = path.extension().is_some_and(|e| e == STATS_NEW);
            if !read_all && !is_new {
                continue;
            }
            let readable = if read_all {
                path
            } else {
                // Claim the record first so concurrent readers never both
                // deliver it.
                let claimed = path.with_extension(STATS_READ);
                match fs::rename(&path, &claimed).await {
                    Ok(()) => claimed,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            let stored = match fs::read(&readable).await {
                Ok(stored) => stored,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            callback(Bytes::from(Opener::open_all(key.clone(), &stored)?));
            delivered += 1;
        }
        Ok(delivered)
    }
}

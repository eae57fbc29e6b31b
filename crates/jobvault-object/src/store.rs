//! Object-store-backed job store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use jobvault_core::crypto::{Opener, Sealer};
use jobvault_core::store::validate_shared_name;
use jobvault_core::stream::{READ_CHUNK_SIZE, WriteOptions};
use jobvault_core::{
    FileId, FileOwner, FileRecord, JobBatch, JobDescription, JobId, JobNode, JobStore, KeyRing,
    ReadHandle, RetryPolicy, StoreConfig, StoreError, StoreResult, StoredContent, UrlRegistry,
    WriteHandle,
};

use crate::backend::{ObjectBackend, ObjectMeta, PutOptions};
use crate::content::{BlobSource, Blobs, ObjectSink, PendingRecord, RecordMode};
use crate::naming::{Containers, validate_store_name};
use crate::records::{
    CONFIG_KEY, EncodedJob, FILE_PREFIX, JOB_PREFIX, JobRecord, STATS_NEW_PREFIX,
    STATS_READ_PREFIX, blob_key, decode_record, file_record_key, job_key, new_file_id,
    owned_files_prefix, shared_blob_key, shared_record_key, stats_name,
};
use crate::url::ObjectUrlAccess;

/// Concurrent record writes issued by `create_many`.
const CREATE_CONCURRENCY: usize = 16;

/// Job keys listed per request while enumerating.
const JOB_PAGE_SIZE: usize = 1000;

/// Rereads of a job whose overflow blob was replaced under the reader.
const LOAD_ATTEMPTS: usize = 16;

/// Config and keys of an attached handle.
struct Attached {
    config: StoreConfig,
    keys: KeyRing,
}

/// Job store keeping records and content in two containers of an object
/// service.
///
/// Records (jobs, file metadata, the config) live in `<name>--jobs`;
/// content, overflowing job records and stats live in `<name>--files`.
/// Every record replacement is a conditional put against the version read
/// just before, so concurrent writers never lose an update silently.
///
/// Records and stats are never server-side encrypted (stats are enveloped
/// with `cse_key` when set); with an `sse_key` set all file content goes to
/// blobs written under that key, and small content is only inlined into
/// records when no `sse_key` is configured.
pub struct ObjectJobStore<B: ObjectBackend> {
    backend: Arc<B>,
    name: String,
    containers: Containers,
    jobs: Blobs<B>,
    files: Blobs<B>,
    urls: Arc<UrlRegistry>,
    attached: Option<Attached>,
}

impl<B: ObjectBackend> std::fmt::Debug for ObjectJobStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectJobStore")
            .field("locator", &self.locator())
            .field("attached", &self.attached.is_some())
            .finish()
    }
}

impl<B: ObjectBackend> ObjectJobStore<B> {
    /// Create a detached handle for the store `name` on `backend`.
    pub fn new(backend: B, name: &str) -> StoreResult<Self> {
        Self::with_retry_policy(Arc::new(backend), name, RetryPolicy::default())
    }

    /// Like [`new`](Self::new), sharing a backend and choosing the retry
    /// schedule for transient backend errors.
    pub fn with_retry_policy(backend: Arc<B>, name: &str, retry: RetryPolicy) -> StoreResult<Self> {
        validate_store_name(name)?;
        let containers = Containers::for_store(name);
        let urls = UrlRegistry::default()
            .with_handler(Arc::new(ObjectUrlAccess::new(backend.clone(), retry)));
        Ok(Self {
            jobs: Blobs::new(backend.clone(), containers.jobs.clone(), retry),
            files: Blobs::new(backend.clone(), containers.files.clone(), retry),
            backend,
            name: name.to_string(),
            containers,
            urls: Arc::new(urls),
            attached: None,
        })
    }

    /// Use a shared URL registry for import and export.
    pub fn with_url_registry(mut self, urls: Arc<UrlRegistry>) -> Self {
        self.urls = urls;
        self
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Containers backing this store.
    pub fn containers(&self) -> &Containers {
        &self.containers
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn attached(&self) -> StoreResult<&Attached> {
        self.attached
            .as_ref()
            .ok_or_else(|| StoreError::NotAttached(self.locator()))
    }

    fn keys(&self) -> StoreResult<&KeyRing> {
        Ok(&self.attached()?.keys)
    }

    /// Validate `config` against this backend's limits.
    fn check_config(&self, config: &StoreConfig) -> StoreResult<()> {
        config.validate()?;
        let min = self.backend.min_part_size();
        if config.part_size < min {
            return Err(StoreError::Config(format!(
                "part_size ({}) is below the {} minimum of {min} bytes",
                config.part_size,
                self.backend.prefix()
            )));
        }
        Ok(())
    }

    async fn attach(&mut self, config: StoreConfig) -> StoreResult<()> {
        let keys = KeyRing::load(&config).await?;
        self.attached = Some(Attached { config, keys });
        Ok(())
    }

    async fn write_config(&self, config: &StoreConfig, options: &PutOptions) -> StoreResult<()> {
        let raw = Bytes::from(serde_json::to_vec_pretty(config)?);
        self.jobs.put(CONFIG_KEY, raw, options).await?;
        Ok(())
    }

    fn write_options(&self, label: String, protected: bool) -> StoreResult<WriteOptions> {
        let attached = self.attached()?;
        Ok(WriteOptions {
            part_size: attached.config.part_size,
            sealer: if protected { attached.keys.sealer() } else { None },
            label,
        })
    }

    fn spawn_writer(
        &self,
        record: PendingRecord<B>,
        content_key: String,
        protected: bool,
    ) -> StoreResult<WriteHandle> {
        let sse = if protected {
            self.keys()?.sse.clone()
        } else {
            None
        };
        let options = self.write_options(record.template.id.to_string(), protected)?;
        let sink = ObjectSink::new(self.files.clone(), content_key, sse, Some(record));
        Ok(WriteHandle::spawn(Box::new(sink), options))
    }

    fn pending(&self, key: String, template: FileRecord, mode: RecordMode) -> StoreResult<PendingRecord<B>> {
        Ok(PendingRecord {
            records: self.jobs.clone(),
            key,
            template,
            mode,
            inline_threshold: self.attached()?.config.inline_threshold,
        })
    }

    async fn ensure_owner(&self, owner: Option<&JobId>) -> StoreResult<()> {
        if let Some(job) = owner {
            if !self.exists(job).await? {
                return Err(StoreError::NoSuchJob(job.to_string()));
            }
        }
        Ok(())
    }

    async fn new_file_writer(&self, owner: Option<&JobId>) -> StoreResult<(WriteHandle, FileId)> {
        self.ensure_owner(owner).await?;
        let id = new_file_id(owner);
        let mut template = FileRecord::empty(id.clone(), FileOwner::for_job(owner));
        template.version = 1;
        let record = self.pending(file_record_key(&id)?, template, RecordMode::Create)?;
        let writer = self.spawn_writer(record, blob_key(&id), true)?;
        Ok((writer, id))
    }

    async fn load_record(&self, key: &str, missing_as: &str) -> StoreResult<(FileRecord, ObjectMeta)> {
        match self.jobs.get_optional(key).await? {
            Some((raw, meta)) => Ok((serde_json::from_slice(&raw)?, meta)),
            None => Err(StoreError::NoSuchFile(missing_as.to_string())),
        }
    }

    /// Reader over a file's current version.
    fn open_content(&self, record: FileRecord) -> StoreResult<ReadHandle> {
        let keys = self.keys()?;
        keys.check_sse(record.sse_fingerprint.as_deref())?;
        let opener = keys.opener();
        match record.content {
            StoredContent::Inline { data } => Ok(ReadHandle::from_stored(Bytes::from(data), opener)),
            StoredContent::Blob {
                key, stored_size, ..
            } => {
                let sse = record.sse_fingerprint.and(keys.sse.clone());
                let source = BlobSource::new(
                    self.files.clone(),
                    key,
                    sse,
                    stored_size,
                    READ_CHUNK_SIZE as u64,
                );
                Ok(ReadHandle::spawn(Box::new(source), opener))
            }
        }
    }

    /// Public URL of the file recorded under `record_key`. Inline content is
    /// moved into a blob first.
    async fn public_url_for(&self, record_key: &str, missing_as: &str) -> StoreResult<String> {
        loop {
            let (mut record, meta) = self.load_record(record_key, missing_as).await?;
            if record.is_encrypted() {
                return Err(StoreError::Encryption(format!(
                    "{missing_as} is encrypted and cannot be published"
                )));
            }
            let data = match &record.content {
                StoredContent::Blob { key, .. } => return self.files.public_url(key).await,
                StoredContent::Inline { data } => Bytes::from(data.clone()),
            };
            let key = blob_key(&record.id);
            let stored_size = data.len() as u64;
            self.files.put(&key, data, &PutOptions::default()).await?;
            record.content = StoredContent::Blob {
                key: key.clone(),
                stored_size,
                parts: 1,
            };
            let raw = Bytes::from(serde_json::to_vec(&record)?);
            match self
                .jobs
                .put(record_key, raw, &PutOptions::if_version(meta.version))
                .await
            {
                Ok(_) => {
                    tracing::debug!(file = missing_as, "Moved inline content to a blob");
                    return self.files.public_url(&key).await;
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    self.files.delete_quietly(&key).await;
                }
                Err(e) => {
                    self.files.delete_quietly(&key).await;
                    return Err(e);
                }
            }
        }
    }

    /// Current record of a job with its version. Overflow stubs are returned
    /// as they are.
    async fn job_record(&self, key: &str) -> StoreResult<Option<(JobRecord, ObjectMeta)>> {
        match self.jobs.get_optional(key).await? {
            Some((raw, meta)) => Ok(Some((decode_record(&raw)?, meta))),
            None => Ok(None),
        }
    }

    async fn put_new_job(&self, job: &JobDescription) -> StoreResult<()> {
        let key = job_key(&job.id)?;
        let encoded = EncodedJob::encode(job)?;
        if let EncodedJob::Overflow { blob_key, body, .. } = &encoded {
            self.files.put(blob_key, body.clone(), &PutOptions::default()).await?;
        }
        match self.jobs.put(&key, encoded.record().clone(), &PutOptions::if_absent()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let EncodedJob::Overflow { blob_key, .. } = &encoded {
                    self.files.delete_quietly(blob_key).await;
                }
                match e {
                    StoreError::PreconditionFailed(_) => Err(StoreError::Internal(format!(
                        "job {} already exists",
                        job.id
                    ))),
                    e => Err(e),
                }
            }
        }
    }

    async fn delete_owned_files(&self, id: &JobId) -> StoreResult<()> {
        for meta in self.jobs.list(&owned_files_prefix(id)).await? {
            if let Some(file_id) = meta.key.strip_prefix(FILE_PREFIX) {
                self.delete_file(&FileId::new(file_id)).await?;
            }
        }
        Ok(())
    }

    /// Stored bytes of one stats record. `None` if it vanished.
    async fn fetch_stats(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.files.get_optional(key).await?.map(|(stored, _)| stored))
    }

    fn open_stats(&self, stored: &[u8]) -> StoreResult<Bytes> {
        let cse = self.keys()?.cse.clone();
        Ok(Bytes::from(Opener::open_all(cse, stored)?))
    }
}

/// Position of a `jobs()` enumeration: the listed but not yet loaded IDs of
/// the current page, and where the next page starts.
struct JobCursor {
    pending: VecDeque<JobId>,
    last_key: Option<String>,
    more: bool,
}

#[async_trait]
impl<B: ObjectBackend> JobStore for ObjectJobStore<B> {
    fn locator(&self) -> String {
        format!(
            "{}:{}:{}",
            self.backend.prefix(),
            self.backend.region(),
            self.name
        )
    }

    fn url_registry(&self) -> &UrlRegistry {
        &self.urls
    }

    async fn initialize(&mut self, config: StoreConfig) -> StoreResult<()> {
        self.check_config(&config)?;
        let jobs_existed = self.jobs.exists().await?;
        if jobs_existed && self.jobs.head(CONFIG_KEY).await?.is_some() {
            return Err(StoreError::JobStoreExists(self.locator()));
        }
        self.attach(config.clone()).await?;

        self.jobs.create().await?;
        if let Err(e) = self.files.create().await {
            if !jobs_existed {
                if let Err(cleanup) = self.jobs.destroy().await {
                    tracing::warn!(container = %self.containers.jobs, error = %cleanup, "Failed to roll back container");
                }
            }
            self.attached = None;
            return Err(e);
        }
        match self.write_config(&config, &PutOptions::if_absent()).await {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed(_)) => {
                self.attached = None;
                return Err(StoreError::JobStoreExists(self.locator()));
            }
            Err(e) => {
                self.attached = None;
                return Err(e);
            }
        }
        tracing::info!(locator = %self.locator(), "Initialized object job store");
        Ok(())
    }

    async fn resume(&mut self) -> StoreResult<()> {
        if !self.jobs.exists().await? {
            return Err(StoreError::NoSuchJobStore(self.locator()));
        }
        let Some((raw, _)) = self.jobs.get_optional(CONFIG_KEY).await? else {
            return Err(StoreError::NoSuchJobStore(self.locator()));
        };
        let config: StoreConfig = serde_json::from_slice(&raw)?;
        self.attach(config).await?;
        tracing::info!(locator = %self.locator(), "Resumed object job store");
        Ok(())
    }

    async fn reconfigure(&mut self, config: StoreConfig) -> StoreResult<()> {
        self.attached()?;
        self.check_config(&config)?;
        self.attach(config.clone()).await?;
        self.write_config(&config, &PutOptions::default()).await
    }

    fn config(&self) -> StoreResult<&StoreConfig> {
        Ok(&self.attached()?.config)
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.files.destroy().await?;
        self.jobs.destroy().await?;
        tracing::info!(locator = %self.locator(), "Destroyed object job store");
        Ok(())
    }

    fn allocate_job_id(&self, _node: &JobNode) -> JobId {
        JobId::new(uuid::Uuid::new_v4().to_string())
    }

    async fn create_many(&self, jobs: Vec<JobDescription>) -> StoreResult<()> {
        self.attached()?;
        futures::stream::iter(
            jobs.into_iter()
                .map(|job| async move { self.put_new_job(&job).await }),
        )
        .buffer_unordered(CREATE_CONCURRENCY)
        .try_collect::<Vec<()>>()
        .await?;
        Ok(())
    }

    fn batch(&self) -> JobBatch<'_> {
        JobBatch::new(self)
    }

    async fn exists(&self, id: &JobId) -> StoreResult<bool> {
        match job_key(id) {
            Ok(key) => Ok(self.jobs.head(&key).await?.is_some()),
            Err(_) => Ok(false),
        }
    }

    async fn load(&self, id: &JobId) -> StoreResult<JobDescription> {
        let key = job_key(id)?;
        // An overflow blob can vanish between reading the stub and the blob
        // when the job is replaced concurrently; the fresh stub names the
        // new blob.
        for _ in 0..LOAD_ATTEMPTS {
            let Some((record, _)) = self.job_record(&key).await? else {
                return Err(StoreError::NoSuchJob(id.to_string()));
            };
            match record {
                JobRecord::Inline { job } => return Ok(job),
                JobRecord::Overflow { blob, .. } => match self.files.get(&blob, None).await {
                    Ok((body, _)) => return Ok(serde_json::from_slice(&body)?),
                    Err(StoreError::NoSuchFile(_)) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
        Err(StoreError::Backend(format!(
            "overflow record of job {id} keeps changing"
        )))
    }

    async fn persist(&self, job: &JobDescription) -> StoreResult<()> {
        let key = job_key(&job.id)?;
        let encoded = EncodedJob::encode(job)?;
        let new_blob = match &encoded {
            EncodedJob::Overflow { blob_key, body, .. } => {
                self.files.put(blob_key, body.clone(), &PutOptions::default()).await?;
                Some(blob_key.as_str())
            }
            EncodedJob::Inline(_) => None,
        };
        let result = loop {
            let (current, meta) = match self.job_record(&key).await {
                Ok(Some(found)) => found,
                Ok(None) => break Err(StoreError::NoSuchJob(job.id.to_string())),
                Err(e) => break Err(e),
            };
            let options = PutOptions::if_version(meta.version);
            match self.jobs.put(&key, encoded.record().clone(), &options).await {
                Ok(_) => break Ok(current.overflow_blob().map(str::to_string)),
                Err(StoreError::PreconditionFailed(_)) => {
                    tracing::debug!(job_id = %job.id, "Job record changed concurrently, retrying");
                }
                Err(e) => break Err(e),
            }
        };
        match result {
            Ok(old_blob) => {
                if let Some(old) = old_blob {
                    self.files.delete_quietly(&old).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(blob) = new_blob {
                    self.files.delete_quietly(blob).await;
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, id: &JobId) -> StoreResult<()> {
        let Ok(key) = job_key(id) else {
            return Ok(());
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
        self.delete_owned_files(id).await?;
        let overflow = match self.job_record(&key).await {
            Ok(found) => found.and_then(|(record, _)| record.overflow_blob().map(str::to_string)),
            Err(StoreError::Json(_)) => None,
            Err(e) => return Err(e),
        };
        self.jobs.delete(&key).await?;
        if let Some(blob) = overflow {
            self.files.delete_quietly(&blob).await;
        }
        tracing::debug!(job_id = %id, "Deleted job");
        Ok(())
    }

    fn jobs(&self) -> BoxStream<'_, StoreResult<JobDescription>> {
        let start = JobCursor {
            pending: VecDeque::new(),
            last_key: None,
            more: true,
        };
        futures::stream::unfold(Some(start), move |cursor| async move {
            let Some(mut cursor) = cursor else {
                return None;
            };
            loop {
                let Some(id) = cursor.pending.pop_front() else {
                    if !cursor.more {
                        return None;
                    }
                    let page = match self
                        .jobs
                        .list_page(JOB_PREFIX, cursor.last_key.as_deref(), JOB_PAGE_SIZE)
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => return Some((Err(e), None)),
                    };
                    cursor.more = page.truncated;
                    if let Some(last) = page.objects.last() {
                        cursor.last_key = Some(last.key.clone());
                    }
                    cursor.pending = page
                        .objects
                        .iter()
                        .filter_map(|meta| meta.key.strip_prefix(JOB_PREFIX))
                        .map(JobId::new)
                        .collect();
                    continue;
                };
                match self.load(&id).await {
                    Ok(job) => return Some((Ok(job), Some(cursor))),
                    Err(StoreError::NoSuchJob(_)) => {}
                    Err(StoreError::Json(e)) => {
                        tracing::warn!(job_id = %id, error = %e, "Skipping unparseable job record");
                    }
                    Err(e) => return Some((Err(e), Some(cursor))),
                }
            }
        })
        .boxed()
    }

    async fn get_empty_file_id(&self, owner: Option<&JobId>) -> StoreResult<FileId> {
        let (writer, id) = self.new_file_writer(owner).await?;
        writer.commit().await?;
        Ok(id)
    }

    async fn write_file_stream(&self, owner: Option<&JobId>) -> StoreResult<(WriteHandle, FileId)> {
        self.new_file_writer(owner).await
    }

    async fn read_file_stream(&self, id: &FileId) -> StoreResult<ReadHandle> {
        let (record, _) = self.load_record(&file_record_key(id)?, id.as_str()).await?;
        self.open_content(record)
    }

    async fn update_file_stream(&self, id: &FileId) -> StoreResult<WriteHandle> {
        let key = file_record_key(id)?;
        let (current, _) = self.load_record(&key, id.as_str()).await?;
        let record = self.pending(key, current, RecordMode::Replace { must_exist: true })?;
        self.spawn_writer(record, blob_key(id), true)
    }

    async fn delete_file(&self, id: &FileId) -> StoreResult<()> {
        let Ok(key) = file_record_key(id) else {
            return Ok(());
        };
        let record = match self.load_record(&key, id.as_str()).await {
            Ok((record, _)) => Some(record),
            Err(StoreError::NoSuchFile(_)) => return Ok(()),
            Err(StoreError::Json(e)) => {
                tracing::warn!(file_id = %id, error = %e, "Deleting unreadable file record");
                None
            }
            Err(e) => return Err(e),
        };
        self.jobs.delete(&key).await?;
        if let Some(StoredContent::Blob { key, .. }) = record.map(|r| r.content) {
            self.files.delete_quietly(&key).await;
        }
        tracing::debug!(file_id = %id, "Deleted file");
        Ok(())
    }

    async fn file_exists(&self, id: &FileId) -> StoreResult<bool> {
        match file_record_key(id) {
            Ok(key) => Ok(self.jobs.head(&key).await?.is_some()),
            Err(_) => Ok(false),
        }
    }

    async fn get_public_url(&self, id: &FileId) -> StoreResult<String> {
        self.public_url_for(&file_record_key(id)?, id.as_str()).await
    }

    async fn write_shared_file_stream(
        &self,
        name: &str,
        is_protected: bool,
    ) -> StoreResult<WriteHandle> {
        validate_shared_name(name)?;
        let mut template = FileRecord::empty(
            FileId::new(shared_record_key(name)),
            FileOwner::Shared(name.to_string()),
        );
        template.public = !is_protected;
        template.version = 1;
        let content_key = if is_protected {
            blob_key(&template.id)
        } else {
            shared_blob_key(name)
        };
        let record = self.pending(
            shared_record_key(name),
            template,
            RecordMode::Replace { must_exist: false },
        )?;
        self.spawn_writer(record, content_key, is_protected)
    }

    async fn read_shared_file_stream(&self, name: &str) -> StoreResult<ReadHandle> {
        validate_shared_name(name).map_err(|_| StoreError::NoSuchFile(name.to_string()))?;
        let (record, _) = self.load_record(&shared_record_key(name), name).await?;
        self.open_content(record)
    }

    async fn get_shared_public_url(&self, name: &str) -> StoreResult<String> {
        validate_shared_name(name).map_err(|_| StoreError::NoSuchFile(name.to_string()))?;
        self.public_url_for(&shared_record_key(name), name).await
    }

    async fn write_stats_and_logging(&self, blob: Bytes) -> StoreResult<()> {
        let stored = match &self.keys()?.cse {
            Some(key) => Bytes::from(Sealer::seal_all(key, &blob)?),
            None => blob,
        };
        let key = format!("{STATS_NEW_PREFIX}{}", stats_name());
        self.files.put(&key, stored, &PutOptions::if_absent()).await?;
        Ok(())
    }

    async fn read_stats_and_logging(
        &self,
        callback: &mut (dyn FnMut(Bytes) + Send),
        read_all: bool,
    ) -> StoreResult<usize> {
        let mut delivered = 0;

        if read_all {
            // Delivered copies win over unread ones of the same name.
            let mut by_name = BTreeMap::new();
            for prefix in [STATS_NEW_PREFIX, STATS_READ_PREFIX] {
                for meta in self.files.list(prefix).await? {
                    if let Some(name) = meta.key.strip_prefix(prefix) {
                        by_name.insert(name.to_string(), meta.key.clone());
                    }
                }
            }
            for (name, key) in &by_name {
                let mut stored = self.fetch_stats(key).await?;
                if stored.is_none() {
                    // Claimed by a purging reader after we listed it.
                    stored = self.fetch_stats(&format!("{STATS_READ_PREFIX}{name}")).await?;
                }
                if let Some(stored) = stored {
                    callback(self.open_stats(&stored)?);
                    delivered += 1;
                }
            }
            return Ok(delivered);
        }

        for meta in self.files.list(STATS_NEW_PREFIX).await? {
            let Some(name) = meta.key.strip_prefix(STATS_NEW_PREFIX) else {
                continue;
            };
            let Some(stored) = self.fetch_stats(&meta.key).await? else {
                continue;
            };
            let record = self.open_stats(&stored)?;
            // Claim the record first so concurrent readers never both
            // deliver it.
            let claimed = match self
                .files
                .put(&format!("{STATS_READ_PREFIX}{name}"), stored, &PutOptions::if_absent())
                .await
            {
                Ok(_) => true,
                Err(StoreError::PreconditionFailed(_)) => false,
                Err(e) => return Err(e),
            };
            self.files.delete(&meta.key).await?;
            if claimed {
                callback(record);
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

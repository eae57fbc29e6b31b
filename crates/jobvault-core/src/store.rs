//! The job store contract.
//!
//! Every backend implements the required methods of [`JobStore`]. The
//! two-phase update, batching, import/export, the root job, `clean` and the
//! staged-deletion recovery sweep are provided on top of them and behave the
//! same for every backend.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::AsyncWriteExt;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::file::FileId;
use crate::job::{JobDescription, JobId, JobNode};
use crate::stream::{ReadHandle, WriteHandle};
use crate::url::{UrlRegistry, parse_url};

/// Shared file holding the root job's ID.
pub const ROOT_JOB_FILE: &str = "rootJobStoreID";

/// Check a shared file name: ASCII letters, digits, `.`, `_` and `-`.
pub fn validate_shared_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > 255 {
        return Err(invalid("longer than 255 characters"));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only letters, digits, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

/// Durable storage for the job graph and the files jobs read and write.
///
/// A handle starts detached; [`initialize`](Self::initialize) creates fresh
/// backing and [`resume`](Self::resume) attaches to existing backing. Every
/// other operation requires an attached handle.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Locator this handle was opened with.
    fn locator(&self) -> String;

    /// Handlers used by [`import_file`](Self::import_file) and
    /// [`export_file`](Self::export_file).
    fn url_registry(&self) -> &UrlRegistry;

    // ---- lifecycle ----

    /// Create fresh backing and persist `config`. Fails with
    /// `JobStoreExists` if backing is already present.
    async fn initialize(&mut self, config: StoreConfig) -> StoreResult<()>;

    /// Attach to existing backing and recover its config. Fails with
    /// `NoSuchJobStore` if there is none.
    async fn resume(&mut self) -> StoreResult<()>;

    /// Persist a changed config (for example new key paths) and reload keys.
    async fn reconfigure(&mut self, config: StoreConfig) -> StoreResult<()>;

    /// Config of an attached handle.
    fn config(&self) -> StoreResult<&StoreConfig>;

    /// Remove all jobs, files, shared files and stats. Idempotent, and
    /// tolerates missing or partially removed backing.
    async fn destroy(&self) -> StoreResult<()>;

    // ---- jobs ----

    /// Pick a fresh, unique ID for a job about to be created.
    fn allocate_job_id(&self, node: &JobNode) -> JobId;

    /// Persist new jobs in one bulk operation.
    async fn create_many(&self, jobs: Vec<JobDescription>) -> StoreResult<()>;

    /// Start a batch of deferred creates.
    fn batch(&self) -> JobBatch<'_>;

    /// Whether a job exists. Never fails for an absent ID.
    async fn exists(&self, id: &JobId) -> StoreResult<bool>;

    /// Load a job. Fails with `NoSuchJob` if absent.
    async fn load(&self, id: &JobId) -> StoreResult<JobDescription>;

    /// Atomically replace a stored job. Fails with `NoSuchJob` if absent.
    async fn persist(&self, job: &JobDescription) -> StoreResult<()>;

    /// Delete a job and release the files it owns. Idempotent; never
    /// touches other jobs.
    async fn delete(&self, id: &JobId) -> StoreResult<()>;

    /// Lazily enumerate stored jobs. Jobs deleted during enumeration are
    /// skipped; jobs created during it may or may not appear.
    fn jobs(&self) -> BoxStream<'_, StoreResult<JobDescription>>;

    // ---- files ----

    /// Allocate an empty file owned by `owner` (or nobody).
    async fn get_empty_file_id(&self, owner: Option<&JobId>) -> StoreResult<FileId>;

    /// Open a writer for a new file. The ID is valid once the writer commits.
    async fn write_file_stream(&self, owner: Option<&JobId>) -> StoreResult<(WriteHandle, FileId)>;

    /// Open a reader. Fails with `NoSuchFile` if the file is absent.
    async fn read_file_stream(&self, id: &FileId) -> StoreResult<ReadHandle>;

    /// Open a writer replacing an existing file's content on commit.
    async fn update_file_stream(&self, id: &FileId) -> StoreResult<WriteHandle>;

    /// Delete a file. Idempotent.
    async fn delete_file(&self, id: &FileId) -> StoreResult<()>;

    /// Whether a file exists.
    async fn file_exists(&self, id: &FileId) -> StoreResult<bool>;

    /// URL from which the file's content can be read by anyone holding it.
    async fn get_public_url(&self, id: &FileId) -> StoreResult<String>;

    // ---- shared files ----

    /// Open a writer for the shared file `name`. Unprotected files are
    /// stored without encryption so they can be served by public URL.
    async fn write_shared_file_stream(
        &self,
        name: &str,
        is_protected: bool,
    ) -> StoreResult<WriteHandle>;

    /// Open a reader for a shared file. Fails with `NoSuchFile` if absent.
    async fn read_shared_file_stream(&self, name: &str) -> StoreResult<ReadHandle>;

    /// Durable public URL of an unprotected shared file.
    async fn get_shared_public_url(&self, name: &str) -> StoreResult<String>;

    // ---- stats and logging ----

    /// Store one telemetry record.
    async fn write_stats_and_logging(&self, blob: Bytes) -> StoreResult<()>;

    /// Deliver stats records to `callback` and return how many were
    /// delivered. Unless `read_all` is set, delivered records are purged and
    /// not delivered again; `read_all` delivers every record ever written
    /// and purges nothing.
    async fn read_stats_and_logging(
        &self,
        callback: &mut (dyn FnMut(Bytes) + Send),
        read_all: bool,
    ) -> StoreResult<usize>;

    // ---- provided ----

    /// Create and persist a single job.
    async fn create(&self, node: JobNode) -> StoreResult<JobDescription> {
        let job = JobDescription::from_node(self.allocate_job_id(&node), node);
        self.create_many(vec![job.clone()]).await?;
        tracing::debug!(job_id = %job.id, "Created job");
        Ok(job)
    }

    /// Persist a changed job.
    ///
    /// With staged deletions the record is written including the list, the
    /// files are deleted, and the record is written again with the list
    /// cleared, so a crash at any point leaves the pending list visible.
    async fn update(&self, job: &mut JobDescription) -> StoreResult<()> {
        self.persist(job).await?;
        if job.has_staged_deletions() {
            self.finish_staged_deletions(job).await?;
        }
        tracing::debug!(job_id = %job.id, "Updated job");
        Ok(())
    }

    /// Phases two and three of [`update`](Self::update).
    async fn finish_staged_deletions(&self, job: &mut JobDescription) -> StoreResult<()> {
        for file_id in &job.files_to_delete {
            self.delete_file(file_id).await?;
        }
        tracing::debug!(
            job_id = %job.id,
            count = job.files_to_delete.len(),
            "Deleted staged files"
        );
        job.files_to_delete.clear();
        self.persist(job).await
    }

    /// Finish staged deletions left behind by interrupted updates.
    ///
    /// Returns the number of jobs repaired.
    async fn recover_staged_deletions(&self) -> StoreResult<usize> {
        let mut pending = Vec::new();
        let mut jobs = self.jobs();
        while let Some(job) = jobs.next().await {
            let job = job?;
            if job.has_staged_deletions() {
                pending.push(job);
            }
        }
        drop(jobs);

        let mut repaired = 0;
        for mut job in pending {
            match self.finish_staged_deletions(&mut job).await {
                Ok(()) => repaired += 1,
                Err(StoreError::NoSuchJob(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if repaired > 0 {
            tracing::info!(repaired, "Recovered staged file deletions");
        }
        Ok(repaired)
    }

    /// Copy a local file into a new store file.
    async fn write_file(&self, local_path: &Path, owner: Option<&JobId>) -> StoreResult<FileId> {
        let mut source = tokio::fs::File::open(local_path).await?;
        let (mut writer, id) = self.write_file_stream(owner).await?;
        tokio::io::copy(&mut source, &mut writer).await?;
        writer.commit().await?;
        Ok(id)
    }

    /// Copy a store file into a local file.
    async fn read_file(&self, id: &FileId, local_path: &Path) -> StoreResult<()> {
        let mut reader = self.read_file_stream(id).await?;
        let mut target = tokio::fs::File::create(local_path).await?;
        let copied = async {
            tokio::io::copy(&mut reader, &mut target).await?;
            target.flush().await?;
            Ok::<(), StoreError>(())
        }
        .await;
        if copied.is_err() {
            drop(target);
            let _ = tokio::fs::remove_file(local_path).await;
        }
        copied
    }

    /// Replace a store file's content with a local file.
    async fn update_file(&self, id: &FileId, local_path: &Path) -> StoreResult<()> {
        let mut source = tokio::fs::File::open(local_path).await?;
        let mut writer = self.update_file_stream(id).await?;
        tokio::io::copy(&mut source, &mut writer).await?;
        writer.commit().await?;
        Ok(())
    }

    /// Import content from a URL or absolute local path.
    ///
    /// With `shared_name` the content becomes that shared file and `None` is
    /// returned; otherwise a new file owned by `owner` is created.
    async fn import_file(
        &self,
        url: &str,
        owner: Option<&JobId>,
        shared_name: Option<&str>,
    ) -> StoreResult<Option<FileId>> {
        let url = parse_url(url)?;
        let mut source = self.url_registry().open_read(&url).await?;
        let (writer, id) = match shared_name {
            Some(name) => (self.write_shared_file_stream(name, true).await?, None),
            None => {
                let (writer, id) = self.write_file_stream(owner).await?;
                (writer, Some(id))
            }
        };
        let mut writer = writer;
        tokio::io::copy(&mut source, &mut writer).await?;
        let summary = writer.commit().await?;
        tracing::debug!(
            url = %url,
            size = summary.size,
            sha256 = %summary.sha256,
            "Imported file"
        );
        Ok(id)
    }

    /// Export a store file to a URL or absolute local path.
    async fn export_file(&self, id: &FileId, url: &str) -> StoreResult<()> {
        let url = parse_url(url)?;
        let reader = self.read_file_stream(id).await?;
        let written = self.url_registry().write_from(&url, Box::new(reader)).await?;
        tracing::debug!(file_id = %id, url = %url, size = written, "Exported file");
        Ok(())
    }

    /// Create a job and record it as the root of the workflow.
    async fn create_root_job(&self, node: JobNode) -> StoreResult<JobDescription> {
        let job = self.create(node).await?;
        let writer = self.write_shared_file_stream(ROOT_JOB_FILE, true).await?;
        writer.write_all_and_commit(job.id.as_str().as_bytes()).await?;
        tracing::info!(job_id = %job.id, "Recorded root job");
        Ok(job)
    }

    /// Load the root job. Fails with `NoSuchJob` if none was recorded.
    async fn load_root_job(&self) -> StoreResult<JobDescription> {
        let id = match self.read_shared_file_stream(ROOT_JOB_FILE).await {
            Ok(reader) => reader.read_to_vec().await?,
            Err(StoreError::NoSuchFile(_)) => {
                return Err(StoreError::NoSuchJob("root job".to_string()));
            }
            Err(e) => return Err(e),
        };
        let id = String::from_utf8(id)
            .map_err(|_| StoreError::Internal("root job ID is not UTF-8".to_string()))?;
        self.load(&JobId::new(id.trim())).await
    }

    /// Delete every job that is not reachable from the root job through
    /// successor references, and return the deleted IDs.
    ///
    /// With `cache`, jobs are taken from it instead of being loaded and only
    /// cached jobs are considered for deletion. Without a root job nothing
    /// is deleted.
    async fn clean(
        &self,
        cache: Option<&HashMap<JobId, JobDescription>>,
    ) -> StoreResult<Vec<JobId>> {
        let root = match self.load_root_job().await {
            Ok(root) => root,
            Err(StoreError::NoSuchJob(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut reachable = HashSet::new();
        let mut queue = vec![root.id.clone()];
        while let Some(id) = queue.pop() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            let job = match cache.and_then(|c| c.get(&id)) {
                Some(job) => job.clone(),
                None => match self.load(&id).await {
                    Ok(job) => job,
                    Err(StoreError::NoSuchJob(_)) => continue,
                    Err(e) => return Err(e),
                },
            };
            queue.extend(job.successor_ids().cloned());
        }

        let candidates: Vec<JobId> = match cache {
            Some(cache) => cache.keys().cloned().collect(),
            None => {
                let mut ids = Vec::new();
                let mut jobs = self.jobs();
                while let Some(job) = jobs.next().await {
                    ids.push(job?.id);
                }
                ids
            }
        };

        let mut deleted = Vec::new();
        for id in candidates {
            if !reachable.contains(&id) {
                self.delete(&id).await?;
                deleted.push(id);
            }
        }
        deleted.sort();
        tracing::info!(deleted = deleted.len(), reachable = reachable.len(), "Cleaned job store");
        Ok(deleted)
    }
}

/// Deferred job creation.
///
/// Jobs created through a batch get their IDs immediately but are stored
/// only by [`flush`](Self::flush), in one bulk operation. Dropping a batch
/// with pending jobs discards them.
pub struct JobBatch<'a> {
    store: &'a dyn JobStore,
    pending: Vec<JobDescription>,
}

impl<'a> JobBatch<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self {
            store,
            pending: Vec::new(),
        }
    }

    /// Assign an ID and queue the job.
    pub fn create(&mut self, node: JobNode) -> JobDescription {
        let job = JobDescription::from_node(self.store.allocate_job_id(&node), node);
        self.pending.push(job.clone());
        job
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Store every queued job.
    pub async fn flush(mut self) -> StoreResult<Vec<JobDescription>> {
        let jobs = std::mem::take(&mut self.pending);
        if !jobs.is_empty() {
            self.store.create_many(jobs.clone()).await?;
            tracing::debug!(count = jobs.len(), "Flushed job batch");
        }
        Ok(jobs)
    }
}

impl Drop for JobBatch<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(count = self.pending.len(), "Job batch dropped without flush");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_name_validation() {
        assert!(validate_shared_name("config.pickle").is_ok());
        assert!(validate_shared_name(ROOT_JOB_FILE).is_ok());
        assert!(validate_shared_name("a-b_c.d").is_ok());
        for bad in ["", ".", "..", "a/b", "with space", "ünï"] {
            assert!(
                matches!(
                    validate_shared_name(bad),
                    Err(StoreError::InvalidName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }
}

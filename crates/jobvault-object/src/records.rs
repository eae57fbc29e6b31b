//! Record keys and the stored form of job records.
//!
//! ```text
//! <name>--jobs   config.json
//!                jobs/<job-id>                      JobRecord
//!                files/<job-id|no-job>/<uuid>       FileRecord
//!                shared/<name>                      FileRecord
//! <name>--files  blob/<file-id>/<uuid>              file content
//!                shared/<name>                      public shared content
//!                overflow/<job-id>/<uuid>           overlarge job records
//!                stats/new/<stamp>-<uuid>           unread stats records
//!                stats/read/<stamp>-<uuid>          delivered stats records
//! ```

use bytes::Bytes;
use jobvault_core::{FileId, JobDescription, JobId, StoreError, StoreResult};
use serde::{Deserialize, Serialize};

pub const CONFIG_KEY: &str = "config.json";
pub const JOB_PREFIX: &str = "jobs/";
pub const FILE_PREFIX: &str = "files/";
pub const SHARED_PREFIX: &str = "shared/";
pub const STATS_NEW_PREFIX: &str = "stats/new/";
pub const STATS_READ_PREFIX: &str = "stats/read/";

/// Owner segment of unowned file IDs.
pub const NO_JOB: &str = "no-job";

/// Largest job record stored directly; bigger ones go to an overflow blob.
pub const MAX_RECORD_SIZE: usize = 400 * 1024;

fn plain_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains('/')
}

pub fn job_key(id: &JobId) -> StoreResult<String> {
    if !plain_segment(id.as_str()) || id.as_str() == NO_JOB {
        return Err(StoreError::NoSuchJob(id.to_string()));
    }
    Ok(format!("{JOB_PREFIX}{id}"))
}

/// Allocate a file ID: `<owner>/<uuid>`.
pub fn new_file_id(owner: Option<&JobId>) -> FileId {
    let owner = owner.map_or(NO_JOB, |j| j.as_str());
    FileId::new(format!("{owner}/{}", uuid::Uuid::new_v4().simple()))
}

pub fn file_record_key(id: &FileId) -> StoreResult<String> {
    match id.as_str().split_once('/') {
        Some((owner, unique)) if plain_segment(owner) && plain_segment(unique) => {
            Ok(format!("{FILE_PREFIX}{id}"))
        }
        _ => Err(StoreError::NoSuchFile(id.to_string())),
    }
}

/// Prefix of the records of files owned by `job`.
pub fn owned_files_prefix(job: &JobId) -> String {
    format!("{FILE_PREFIX}{job}/")
}

pub fn shared_record_key(name: &str) -> String {
    format!("{SHARED_PREFIX}{name}")
}

/// Fresh content key for a new version of a file.
pub fn blob_key(id: &FileId) -> String {
    format!("blob/{id}/{}", uuid::Uuid::new_v4().simple())
}

/// Stable content key of a public shared file, so its URL survives rewrites.
pub fn shared_blob_key(name: &str) -> String {
    format!("{SHARED_PREFIX}{name}")
}

pub fn overflow_key(id: &JobId) -> String {
    format!("overflow/{id}/{}", uuid::Uuid::new_v4().simple())
}

pub fn stats_name() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.9f"),
        uuid::Uuid::new_v4().simple()
    )
}

/// Stored form of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum JobRecord {
    Inline { job: JobDescription },
    /// The serialized job lives in the files container under `blob`.
    Overflow { blob: String, size: u64 },
}

impl JobRecord {
    pub fn overflow_blob(&self) -> Option<&str> {
        match self {
            JobRecord::Overflow { blob, .. } => Some(blob),
            JobRecord::Inline { .. } => None,
        }
    }
}

/// A job ready to be written.
pub enum EncodedJob {
    Inline(Bytes),
    Overflow {
        /// Key of the overflow blob in the files container.
        blob_key: String,
        /// The serialized job.
        body: Bytes,
        /// The stub record pointing at the blob.
        record: Bytes,
    },
}

impl EncodedJob {
    pub fn encode(job: &JobDescription) -> StoreResult<Self> {
        let record = serde_json::to_vec(&JobRecord::Inline { job: job.clone() })?;
        if record.len() <= MAX_RECORD_SIZE {
            return Ok(EncodedJob::Inline(Bytes::from(record)));
        }
        let body = serde_json::to_vec(job)?;
        let blob_key = overflow_key(&job.id);
        let stub = JobRecord::Overflow {
            blob: blob_key.clone(),
            size: body.len() as u64,
        };
        Ok(EncodedJob::Overflow {
            blob_key,
            body: Bytes::from(body),
            record: Bytes::from(serde_json::to_vec(&stub)?),
        })
    }

    pub fn record(&self) -> &Bytes {
        match self {
            EncodedJob::Inline(record) => record,
            EncodedJob::Overflow { record, .. } => record,
        }
    }
}

pub fn decode_record(raw: &[u8]) -> StoreResult<JobRecord> {
    Ok(serde_json::from_slice(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobvault_core::{JobNode, Requirements};

    fn job(name: String) -> JobDescription {
        JobDescription::from_node(
            JobId::new("j-1"),
            JobNode::new("cmd", Requirements::default()).with_name(name),
        )
    }

    #[test]
    fn test_small_jobs_stay_inline() {
        let job = job("small".to_string());
        let encoded = EncodedJob::encode(&job).unwrap();
        assert!(matches!(encoded, EncodedJob::Inline(_)));
        match decode_record(encoded.record()).unwrap() {
            JobRecord::Inline { job: back } => assert_eq!(back, job),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_large_jobs_overflow() {
        let job = job("x".repeat(MAX_RECORD_SIZE));
        let EncodedJob::Overflow {
            blob_key,
            body,
            record,
        } = EncodedJob::encode(&job).unwrap()
        else {
            panic!("expected overflow");
        };
        assert!(blob_key.starts_with("overflow/j-1/"));
        assert!(record.len() < 1024);
        let stub = decode_record(&record).unwrap();
        assert_eq!(stub.overflow_blob(), Some(blob_key.as_str()));
        let back: JobDescription = serde_json::from_slice(&body).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_keys_reject_path_tricks() {
        assert!(job_key(&JobId::new("a/b")).is_err());
        assert!(job_key(&JobId::new("")).is_err());
        assert_eq!(job_key(&JobId::new("abc")).unwrap(), "jobs/abc");

        let id = new_file_id(Some(&JobId::new("abc")));
        assert!(file_record_key(&id).unwrap().starts_with("files/abc/"));
        assert!(owned_files_prefix(&JobId::new("abc")).starts_with("files/abc/"));
        for bad in ["", "x", "a/b/c", "../x", "/x"] {
            assert!(
                matches!(file_record_key(&FileId::new(bad)), Err(StoreError::NoSuchFile(_))),
                "{bad:?}"
            );
        }
    }
}

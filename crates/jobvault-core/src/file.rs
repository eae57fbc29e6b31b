//! File identifiers and the per-file metadata record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Opaque identifier of a stored file.
///
/// The string embeds whatever the owning backend needs to locate the file
/// (the file backend uses a relative path ending in the original file name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Wrap a backend-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who a file belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FileOwner {
    /// Released together with the owning job.
    Job(JobId),
    /// Keyed by name, lives until the store is destroyed.
    Shared(String),
    /// Created without an owner; removed only by explicit deletion.
    Unowned,
}

impl FileOwner {
    /// Owner for an optional job.
    pub fn for_job(job: Option<&JobId>) -> Self {
        match job {
            Some(id) => FileOwner::Job(id.clone()),
            None => FileOwner::Unowned,
        }
    }

    /// The owning job, if any.
    pub fn job(&self) -> Option<&JobId> {
        match self {
            FileOwner::Job(id) => Some(id),
            _ => None,
        }
    }
}

/// Size and SHA-256 of a logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    /// Logical (plaintext) size in bytes.
    pub size: u64,

    /// Hex SHA-256 of the logical stream.
    pub sha256: String,
}

impl ContentSummary {
    /// Summary of the empty stream.
    pub fn empty() -> Self {
        Self {
            size: 0,
            sha256: crate::multipart::EMPTY_SHA256.to_string(),
        }
    }
}

/// Where a file's bytes physically live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum StoredContent {
    /// Stored bytes kept inside the metadata record itself.
    Inline {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Stored bytes kept in a separate blob, uploaded in `parts` pieces.
    Blob {
        /// Blob key in the backend's file container.
        key: String,
        /// Stored (possibly enveloped) size.
        stored_size: u64,
        /// Number of parts the blob was uploaded in (1 for a single put).
        parts: u32,
    },
}

impl StoredContent {
    /// Whether the content lives inside the record.
    pub fn is_inline(&self) -> bool {
        matches!(self, StoredContent::Inline { .. })
    }
}

/// Per-file metadata persisted by record-keeping backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File identifier.
    pub id: FileId,

    /// Owning job, shared name, or none.
    pub owner: FileOwner,

    /// Logical content summary of the current version.
    pub summary: ContentSummary,

    /// Content was enveloped client-side.
    pub client_encrypted: bool,

    /// Fingerprint of the server-side key the blob was written with.
    pub sse_fingerprint: Option<String>,

    /// Whether a public URL may be handed out for this file.
    pub public: bool,

    /// Storage mode of the current version.
    pub content: StoredContent,

    /// Monotonic version, bumped on every content replacement.
    pub version: u64,

    /// Last modification time.
    pub modified_at: DateTime<Utc>,
}

impl FileRecord {
    /// A freshly allocated, empty file.
    pub fn empty(id: FileId, owner: FileOwner) -> Self {
        Self {
            id,
            owner,
            summary: ContentSummary::empty(),
            client_encrypted: false,
            sse_fingerprint: None,
            public: false,
            content: StoredContent::Inline { data: Vec::new() },
            version: 0,
            modified_at: Utc::now(),
        }
    }

    /// Whether reading this file requires any key material.
    pub fn is_encrypted(&self) -> bool {
        self.client_encrypted || self.sse_fingerprint.is_some()
    }
}

/// Decide whether stored content of `stored_size` bytes is inlined.
///
/// Public files always get a blob so they can be addressed by URL.
pub fn should_inline(stored_size: u64, inline_threshold: u64, public: bool) -> bool {
    !public && stored_size <= inline_threshold
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_decision() {
        assert!(should_inline(0, 1024, false));
        assert!(should_inline(1024, 1024, false));
        assert!(!should_inline(1025, 1024, false));
        assert!(!should_inline(0, 1024, true));
    }

    #[test]
    fn test_empty_record_is_inline_and_plain() {
        let record = FileRecord::empty(FileId::new("f-1"), FileOwner::Unowned);
        assert!(record.content.is_inline());
        assert!(!record.is_encrypted());
        assert_eq!(record.summary, ContentSummary::empty());
    }

    #[test]
    fn test_record_json_roundtrip() {
        let mut record = FileRecord::empty(
            FileId::new("f-1"),
            FileOwner::Job(JobId::new("j-1")),
        );
        record.content = StoredContent::Inline {
            data: vec![0, 159, 146, 150],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"mode\":\"inline\""));
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
        assert_eq!(back.owner.job(), Some(&JobId::new("j-1")));
    }
}

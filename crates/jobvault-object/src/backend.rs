//! The object service seam.
//!
//! An [`ObjectBackend`] is a thin, stateless view of one vendor's object
//! service in one region: named containers (buckets) holding keyed blobs,
//! with conditional puts, ranged reads and multipart uploads. Everything the
//! job store needs beyond that (records, ownership, encryption envelopes,
//! retries) lives in [`ObjectJobStore`](crate::ObjectJobStore).
//!
//! ## Method table
//!
//! | Method | Kind | Fails with |
//! |--------|------|------------|
//! | `create_container()` | async | `LocationConflict` if it exists in another region |
//! | `container_exists()` | async | |
//! | `delete_container()` | async | never for a missing container |
//! | `put()` | async | `PreconditionFailed` |
//! | `get()` / `get_range()` | async | `NoSuchFile`, `EncryptionKeyMissing`, `Encryption` |
//! | `head()` | async | |
//! | `delete()` | async | never for a missing key |
//! | `list()` / `list_page()` | async | |
//! | `create_multipart()` / `upload_part()` / `complete_multipart()` / `abort_multipart()` | async | |
//! | `public_url()` | async | `NoSuchFile` |
//!
//! Throttling and timeouts are reported as `StoreError::Transient`; callers
//! retry those around each individual call.

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use jobvault_core::{EncryptionKey, StoreResult};

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,

    /// Stored size in bytes. Services that do not report the assembled
    /// size of a completed multipart upload leave it 0 there.
    pub size: u64,

    /// Opaque version tag, changed by every successful put.
    pub version: String,

    /// Fingerprint of the server-side key the object was written with.
    /// Listings may leave it unset.
    pub sse_fingerprint: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// More objects follow the last one in `objects`.
    pub truncated: bool,
}

/// Condition a put must satisfy to take effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional overwrite.
    #[default]
    None,
    /// Only create; fail if the key exists.
    IfAbsent,
    /// Only replace the given version; fail if the key is gone or changed.
    IfVersion(String),
}

/// Options for a single put.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub precondition: Precondition,

    /// Customer-provided server-side encryption key.
    pub sse: Option<EncryptionKey>,
}

impl PutOptions {
    pub fn if_absent() -> Self {
        Self {
            precondition: Precondition::IfAbsent,
            sse: None,
        }
    }

    pub fn if_version(version: impl Into<String>) -> Self {
        Self {
            precondition: Precondition::IfVersion(version.into()),
            sse: None,
        }
    }

    pub fn with_sse(mut self, sse: Option<EncryptionKey>) -> Self {
        self.sse = sse;
        self
    }
}

/// One vendor's object service, bound to a region.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Locator prefix of stores on this backend (`aws`, `mem`).
    fn prefix(&self) -> &'static str;

    /// URL schemes under which objects can be read natively.
    fn url_schemes(&self) -> &'static [&'static str];

    /// Region this handle creates containers in.
    fn region(&self) -> &str;

    /// Smallest size the service accepts for a multipart part other than
    /// the last one.
    fn min_part_size(&self) -> u64 {
        1
    }

    /// Create a container in this handle's region. Succeeds if it already
    /// exists here.
    async fn create_container(&self, container: &str) -> StoreResult<()>;

    async fn container_exists(&self, container: &str) -> StoreResult<bool>;

    /// Delete a container and everything in it.
    async fn delete_container(&self, container: &str) -> StoreResult<()>;

    async fn put(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<ObjectMeta>;

    /// Read a whole object.
    async fn get(
        &self,
        container: &str,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<(Bytes, ObjectMeta)>;

    /// Read `range` of an object. The end is clamped to the object size.
    async fn get_range(
        &self,
        container: &str,
        key: &str,
        range: Range<u64>,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<Bytes>;

    async fn head(&self, container: &str, key: &str) -> StoreResult<Option<ObjectMeta>>;

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()>;

    /// Objects whose key starts with `prefix`, in key order.
    async fn list(&self, container: &str, prefix: &str) -> StoreResult<Vec<ObjectMeta>>;

    /// At most `limit` objects whose key starts with `prefix` and sorts
    /// after `start_after`, in key order. A missing container lists empty.
    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage>;

    /// Start a multipart upload and return its upload ID.
    async fn create_multipart(
        &self,
        container: &str,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String>;

    /// Upload part `number` (1-based) and return its tag.
    async fn upload_part(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Bytes,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String>;

    /// Assemble the listed parts, in order, into the object.
    async fn complete_multipart(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> StoreResult<ObjectMeta>;

    async fn abort_multipart(&self, container: &str, key: &str, upload_id: &str)
    -> StoreResult<()>;

    /// URL from which anyone can read the object.
    async fn public_url(&self, container: &str, key: &str) -> StoreResult<String>;
}

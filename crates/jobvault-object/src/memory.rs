//! In-process object service.
//!
//! [`MemoryObjectService`] keeps containers and objects in memory and
//! behaves like a regional object store: containers belong to one region,
//! puts can be conditional, customer-provided keys are checked on reads, and
//! multipart uploads are assembled on completion. Several [`MemoryBackend`]
//! handles (possibly for different regions) can share one service, which is
//! how tests exercise cross-region conflicts and multiple workers.

use std::collections::BTreeMap;
use std::ops::{Bound, Range};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use jobvault_core::{EncryptionKey, StoreError, StoreResult};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::backend::{ListPage, ObjectBackend, ObjectMeta, Precondition, PutOptions};

/// URL scheme of objects in a memory service.
pub const MEMORY_SCHEME: &str = "mem";

struct StoredObject {
    data: Bytes,
    version: String,
    sse_fingerprint: Option<String>,
}

struct Container {
    region: String,
    objects: BTreeMap<String, StoredObject>,
}

struct Upload {
    container: String,
    key: String,
    sse_fingerprint: Option<String>,
    parts: FxHashMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    containers: FxHashMap<String, Container>,
    uploads: FxHashMap<String, Upload>,
}

/// Containers and objects held in memory.
#[derive(Default)]
pub struct MemoryObjectService {
    state: RwLock<State>,
    next_version: AtomicU64,
    faults: AtomicU32,
    list_requests: AtomicU64,
}

impl MemoryObjectService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide service used by `mem:` locators.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<MemoryObjectService>> = OnceLock::new();
        GLOBAL.get_or_init(MemoryObjectService::new).clone()
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn inject_transient_faults(&self, count: u32) {
        self.faults.store(count, Ordering::SeqCst);
    }

    /// Region of a container, if it exists.
    pub async fn container_region(&self, container: &str) -> Option<String> {
        let state = self.state.read().await;
        state.containers.get(container).map(|c| c.region.clone())
    }

    /// Number of objects in a container.
    pub async fn object_count(&self, container: &str) -> usize {
        let state = self.state.read().await;
        state
            .containers
            .get(container)
            .map_or(0, |c| c.objects.len())
    }

    /// Listing requests served so far.
    pub fn list_requests(&self) -> u64 {
        self.list_requests.load(Ordering::SeqCst)
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub async fn pending_uploads(&self) -> usize {
        self.state.read().await.uploads.len()
    }

    fn fault(&self, operation: &str) -> StoreResult<()> {
        let taken = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Transient(format!("{operation}: slow down"))),
            Err(_) => Ok(()),
        }
    }

    fn version(&self) -> String {
        format!("v{}", self.next_version.fetch_add(1, Ordering::Relaxed))
    }
}

fn check_key(
    key_name: &str,
    stored: Option<&str>,
    provided: Option<&EncryptionKey>,
) -> StoreResult<()> {
    match (stored, provided) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(StoreError::EncryptionKeyMissing),
        (Some(fp), Some(key)) if key.fingerprint() == fp => Ok(()),
        (Some(_), Some(_)) => Err(StoreError::Encryption(format!(
            "{key_name} was written with a different customer key"
        ))),
    }
}

fn meta(key: &str, object: &StoredObject) -> ObjectMeta {
    ObjectMeta {
        key: key.to_string(),
        size: object.data.len() as u64,
        version: object.version.clone(),
        sse_fingerprint: object.sse_fingerprint.clone(),
    }
}

/// A [`MemoryObjectService`] seen from one region.
#[derive(Clone)]
pub struct MemoryBackend {
    service: Arc<MemoryObjectService>,
    region: String,
    min_part_size: u64,
}

impl MemoryBackend {
    pub fn new(service: Arc<MemoryObjectService>, region: impl Into<String>) -> Self {
        Self {
            service,
            region: region.into(),
            min_part_size: 1,
        }
    }

    /// Reject multipart uploads with smaller non-final parts, the way
    /// cloud services do.
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn service(&self) -> &Arc<MemoryObjectService> {
        &self.service
    }

    fn missing_container(container: &str) -> StoreError {
        StoreError::NoSuchJobStore(format!("{MEMORY_SCHEME}://{container}"))
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("region", &self.region)
            .field("min_part_size", &self.min_part_size)
            .finish()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn prefix(&self) -> &'static str {
        MEMORY_SCHEME
    }

    fn url_schemes(&self) -> &'static [&'static str] {
        &[MEMORY_SCHEME]
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        self.service.fault("create_container")?;
        let mut state = self.service.state.write().await;
        match state.containers.get(container) {
            Some(existing) if existing.region == self.region => Ok(()),
            Some(existing) => Err(StoreError::LocationConflict {
                resource: container.to_string(),
                existing: existing.region.clone(),
                requested: self.region.clone(),
            }),
            None => {
                state.containers.insert(
                    container.to_string(),
                    Container {
                        region: self.region.clone(),
                        objects: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn container_exists(&self, container: &str) -> StoreResult<bool> {
        self.service.fault("container_exists")?;
        Ok(self.service.state.read().await.containers.contains_key(container))
    }

    async fn delete_container(&self, container: &str) -> StoreResult<()> {
        self.service.fault("delete_container")?;
        let mut state = self.service.state.write().await;
        state.containers.remove(container);
        state.uploads.retain(|_, u| u.container != container);
        Ok(())
    }

    async fn put(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<ObjectMeta> {
        self.service.fault("put")?;
        let version = self.service.version();
        let mut state = self.service.state.write().await;
        let objects = &mut state
            .containers
            .get_mut(container)
            .ok_or_else(|| Self::missing_container(container))?
            .objects;
        let current = objects.get(key).map(|o| o.version.as_str());
        let allowed = match &options.precondition {
            Precondition::None => true,
            Precondition::IfAbsent => current.is_none(),
            Precondition::IfVersion(expected) => current == Some(expected.as_str()),
        };
        if !allowed {
            return Err(StoreError::PreconditionFailed(key.to_string()));
        }
        let object = StoredObject {
            data,
            version,
            sse_fingerprint: options.sse.as_ref().map(EncryptionKey::fingerprint),
        };
        let meta = meta(key, &object);
        objects.insert(key.to_string(), object);
        Ok(meta)
    }

    async fn get(
        &self,
        container: &str,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<(Bytes, ObjectMeta)> {
        self.service.fault("get")?;
        let state = self.service.state.read().await;
        let object = state
            .containers
            .get(container)
            .and_then(|c| c.objects.get(key))
            .ok_or_else(|| StoreError::NoSuchFile(key.to_string()))?;
        check_key(key, object.sse_fingerprint.as_deref(), sse)?;
        Ok((object.data.clone(), meta(key, object)))
    }

    async fn get_range(
        &self,
        container: &str,
        key: &str,
        range: Range<u64>,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<Bytes> {
        self.service.fault("get_range")?;
        let state = self.service.state.read().await;
        let object = state
            .containers
            .get(container)
            .and_then(|c| c.objects.get(key))
            .ok_or_else(|| StoreError::NoSuchFile(key.to_string()))?;
        check_key(key, object.sse_fingerprint.as_deref(), sse)?;
        let len = object.data.len();
        let end = (range.end as usize).min(len);
        let start = (range.start as usize).min(end);
        Ok(object.data.slice(start..end))
    }

    async fn head(&self, container: &str, key: &str) -> StoreResult<Option<ObjectMeta>> {
        self.service.fault("head")?;
        let state = self.service.state.read().await;
        Ok(state
            .containers
            .get(container)
            .and_then(|c| c.objects.get(key))
            .map(|o| meta(key, o)))
    }

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()> {
        self.service.fault("delete")?;
        let mut state = self.service.state.write().await;
        if let Some(c) = state.containers.get_mut(container) {
            c.objects.remove(key);
        }
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        self.service.fault("list")?;
        self.service.list_requests.fetch_add(1, Ordering::SeqCst);
        let state = self.service.state.read().await;
        let Some(c) = state.containers.get(container) else {
            return Ok(Vec::new());
        };
        Ok(c.objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| meta(k, o))
            .collect())
    }

    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        self.service.fault("list")?;
        self.service.list_requests.fetch_add(1, Ordering::SeqCst);
        let state = self.service.state.read().await;
        let Some(c) = state.containers.get(container) else {
            return Ok(ListPage::default());
        };
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        let mut objects: Vec<ObjectMeta> = c
            .objects
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit + 1)
            .map(|(k, o)| meta(k, o))
            .collect();
        let truncated = objects.len() > limit;
        objects.truncate(limit);
        Ok(ListPage { objects, truncated })
    }

    async fn create_multipart(
        &self,
        container: &str,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String> {
        self.service.fault("create_multipart")?;
        let mut state = self.service.state.write().await;
        if !state.containers.contains_key(container) {
            return Err(Self::missing_container(container));
        }
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                container: container.to_string(),
                key: key.to_string(),
                sse_fingerprint: sse.map(EncryptionKey::fingerprint),
                parts: FxHashMap::default(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Bytes,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String> {
        self.service.fault("upload_part")?;
        let tag = self.service.version();
        let mut state = self.service.state.write().await;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.container == container && u.key == key)
            .ok_or_else(|| StoreError::Backend(format!("no such upload {upload_id}")))?;
        check_key(key, upload.sse_fingerprint.as_deref(), sse)?;
        upload.parts.insert(number, (tag.clone(), data));
        Ok(tag)
    }

    async fn complete_multipart(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> StoreResult<ObjectMeta> {
        self.service.fault("complete_multipart")?;
        let version = self.service.version();
        let mut state = self.service.state.write().await;
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.container == container && u.key == key)
            .ok_or_else(|| StoreError::Backend(format!("no such upload {upload_id}")))?;
        let mut data = BytesMut::new();
        for (i, (number, tag)) in parts.iter().enumerate() {
            match upload.parts.get(number) {
                Some((_, part))
                    if i + 1 < parts.len() && (part.len() as u64) < self.min_part_size =>
                {
                    return Err(StoreError::Backend(format!(
                        "part {number} of upload {upload_id} is smaller than {} bytes",
                        self.min_part_size
                    )));
                }
                Some((stored_tag, part)) if stored_tag == tag => data.extend_from_slice(part),
                _ => {
                    return Err(StoreError::Backend(format!(
                        "part {number} of upload {upload_id} is missing or stale"
                    )));
                }
            }
        }
        let object = StoredObject {
            data: data.freeze(),
            version,
            sse_fingerprint: upload.sse_fingerprint,
        };
        let meta = meta(key, &object);
        state
            .containers
            .get_mut(container)
            .ok_or_else(|| Self::missing_container(container))?
            .objects
            .insert(key.to_string(), object);
        Ok(meta)
    }

    async fn abort_multipart(
        &self,
        _container: &str,
        _key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        self.service.fault("abort_multipart")?;
        self.service.state.write().await.uploads.remove(upload_id);
        Ok(())
    }

    async fn public_url(&self, container: &str, key: &str) -> StoreResult<String> {
        match self.head(container, key).await? {
            Some(_) => Ok(format!("{MEMORY_SCHEME}://{container}/{key}")),
            None => Err(StoreError::NoSuchFile(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(region: &str) -> (Arc<MemoryObjectService>, MemoryBackend) {
        let service = MemoryObjectService::new();
        let backend = MemoryBackend::new(service.clone(), region);
        (service, backend)
    }

    #[tokio::test]
    async fn test_list_pages() {
        let (_, b) = backend("local");
        b.create_container("c").await.unwrap();
        for key in ["a/1", "b/1", "b/2", "b/3", "c/1"] {
            b.put("c", key, Bytes::new(), &PutOptions::default())
                .await
                .unwrap();
        }

        let first = b.list_page("c", "b/", None, 2).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["b/1", "b/2"]);
        assert!(first.truncated);

        let rest = b.list_page("c", "b/", Some("b/2"), 2).await.unwrap();
        let keys: Vec<_> = rest.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["b/3"]);
        assert!(!rest.truncated);

        let exact = b.list_page("c", "b/", None, 3).await.unwrap();
        assert_eq!(exact.objects.len(), 3);
        assert!(!exact.truncated);

        let missing = b.list_page("nope", "", None, 10).await.unwrap();
        assert!(missing.objects.is_empty() && !missing.truncated);
    }

    #[tokio::test]
    async fn test_min_part_size_applies_to_non_final_parts() {
        let (_, b) = backend("local");
        let b = b.with_min_part_size(4);
        b.create_container("c").await.unwrap();

        let upload = b.create_multipart("c", "k", None).await.unwrap();
        let one = b
            .upload_part("c", "k", &upload, 1, Bytes::from_static(b"abcd"), None)
            .await
            .unwrap();
        let two = b
            .upload_part("c", "k", &upload, 2, Bytes::from_static(b"e"), None)
            .await
            .unwrap();
        b.complete_multipart("c", "k", &upload, vec![(1, one), (2, two)])
            .await
            .unwrap();

        let upload = b.create_multipart("c", "small", None).await.unwrap();
        let one = b
            .upload_part("c", "small", &upload, 1, Bytes::from_static(b"ab"), None)
            .await
            .unwrap();
        let two = b
            .upload_part("c", "small", &upload, 2, Bytes::from_static(b"cd"), None)
            .await
            .unwrap();
        assert!(matches!(
            b.complete_multipart("c", "small", &upload, vec![(1, one), (2, two)])
                .await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_conditional_puts() {
        let (_, b) = backend("local");
        b.create_container("c").await.unwrap();

        let first = b
            .put("c", "k", Bytes::from_static(b"1"), &PutOptions::if_absent())
            .await
            .unwrap();
        assert!(matches!(
            b.put("c", "k", Bytes::from_static(b"2"), &PutOptions::if_absent())
                .await,
            Err(StoreError::PreconditionFailed(_))
        ));

        let second = b
            .put(
                "c",
                "k",
                Bytes::from_static(b"2"),
                &PutOptions::if_version(&first.version),
            )
            .await
            .unwrap();
        assert_ne!(first.version, second.version);
        assert!(matches!(
            b.put(
                "c",
                "k",
                Bytes::from_static(b"3"),
                &PutOptions::if_version(&first.version)
            )
            .await,
            Err(StoreError::PreconditionFailed(_))
        ));

        let (data, _) = b.get("c", "k", None).await.unwrap();
        assert_eq!(data.as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_region_conflict() {
        let (service, west) = backend("us-west-1");
        let east = MemoryBackend::new(service.clone(), "us-east-1");
        west.create_container("c").await.unwrap();
        west.create_container("c").await.unwrap();
        match east.create_container("c").await {
            Err(StoreError::LocationConflict {
                existing,
                requested,
                ..
            }) => {
                assert_eq!(existing, "us-west-1");
                assert_eq!(requested, "us-east-1");
            }
            other => panic!("expected LocationConflict, got {other:?}"),
        }
        assert_eq!(service.container_region("c").await.as_deref(), Some("us-west-1"));
    }

    #[tokio::test]
    async fn test_customer_keys_are_checked() {
        let (_, b) = backend("local");
        b.create_container("c").await.unwrap();
        let key = EncryptionKey::generate();
        let options = PutOptions::default().with_sse(Some(key.clone()));
        b.put("c", "k", Bytes::from_static(b"secret"), &options)
            .await
            .unwrap();

        assert!(matches!(
            b.get("c", "k", None).await,
            Err(StoreError::EncryptionKeyMissing)
        ));
        assert!(matches!(
            b.get("c", "k", Some(&EncryptionKey::generate())).await,
            Err(StoreError::Encryption(_))
        ));
        let (data, meta) = b.get("c", "k", Some(&key)).await.unwrap();
        assert_eq!(data.as_ref(), b"secret");
        assert_eq!(meta.sse_fingerprint, Some(key.fingerprint()));
    }

    #[tokio::test]
    async fn test_multipart_assembly_and_ranges() {
        let (service, b) = backend("local");
        b.create_container("c").await.unwrap();
        let id = b.create_multipart("c", "big", None).await.unwrap();
        let t2 = b
            .upload_part("c", "big", &id, 2, Bytes::from_static(b"world"), None)
            .await
            .unwrap();
        let t1 = b
            .upload_part("c", "big", &id, 1, Bytes::from_static(b"hello "), None)
            .await
            .unwrap();
        assert_eq!(service.pending_uploads().await, 1);
        let meta = b
            .complete_multipart("c", "big", &id, vec![(1, t1), (2, t2)])
            .await
            .unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(service.pending_uploads().await, 0);

        let range = b.get_range("c", "big", 6..100, None).await.unwrap();
        assert_eq!(range.as_ref(), b"world");
        let empty = b.get_range("c", "big", 50..60, None).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_listing_and_faults() {
        let (service, b) = backend("local");
        b.create_container("c").await.unwrap();
        for key in ["jobs/b", "jobs/a", "files/x"] {
            b.put("c", key, Bytes::new(), &PutOptions::default())
                .await
                .unwrap();
        }
        let keys: Vec<_> = b
            .list("c", "jobs/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["jobs/a", "jobs/b"]);

        service.inject_transient_faults(2);
        assert!(b.head("c", "jobs/a").await.unwrap_err().is_transient());
        assert!(b.head("c", "jobs/a").await.unwrap_err().is_transient());
        assert!(b.head("c", "jobs/a").await.unwrap().is_some());
        assert!(b.head("missing", "jobs/a").await.unwrap().is_none());
    }
}

//! Object-store specifics: container handling, retries and what is left
//! behind in the containers.

use std::sync::Arc;
use std::time::Duration;

use jobvault_conformance::support::{child_node, random_bytes, read_back, write_stream};
use jobvault_core::{JobStore, RetryPolicy, StoreConfig, StoreError};
use jobvault_object::{MemoryBackend, MemoryObjectService, ObjectJobStore};
use tokio::io::AsyncWriteExt;

const PART: u64 = 64 * 1024;

fn quick_retries() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        timeout: Duration::from_secs(5),
    }
}

fn store_on(
    service: &Arc<MemoryObjectService>,
    region: &str,
    name: &str,
) -> ObjectJobStore<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new(service.clone(), region));
    ObjectJobStore::with_retry_policy(backend, name, quick_retries()).unwrap()
}

fn config() -> StoreConfig {
    StoreConfig::default()
        .with_part_size(PART)
        .with_inline_threshold(1024)
}

#[test]
fn test_invalid_store_names() {
    let service = MemoryObjectService::new();
    for name in ["", "Caps", "a--b", "-x", "under_score"] {
        let backend = MemoryBackend::new(service.clone(), "local");
        assert!(
            matches!(
                ObjectJobStore::new(backend, name),
                Err(StoreError::InvalidName { .. })
            ),
            "{name:?}"
        );
    }
}

#[tokio::test]
async fn test_locator_and_containers() {
    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "eu-north-1", "run-7");
    assert_eq!(store.locator(), "mem:eu-north-1:run-7");
    assert!(matches!(store.config(), Err(StoreError::NotAttached(_))));

    store.initialize(config()).await.unwrap();
    assert_eq!(
        service.container_region("run-7--jobs").await.as_deref(),
        Some("eu-north-1")
    );
    assert_eq!(
        service.container_region("run-7--files").await.as_deref(),
        Some("eu-north-1")
    );

    store.destroy().await.unwrap();
    assert_eq!(service.container_region("run-7--jobs").await, None);
    assert_eq!(service.container_region("run-7--files").await, None);
}

#[tokio::test]
async fn test_location_conflict_rolls_back() {
    let service = MemoryObjectService::new();
    let squatter = MemoryBackend::new(service.clone(), "us-east-1");
    jobvault_object::ObjectBackend::create_container(&squatter, "taken--files")
        .await
        .unwrap();

    let mut store = store_on(&service, "eu-west-1", "taken");
    match store.initialize(config()).await {
        Err(StoreError::LocationConflict {
            resource,
            existing,
            requested,
        }) => {
            assert_eq!(resource, "taken--files");
            assert_eq!(existing, "us-east-1");
            assert_eq!(requested, "eu-west-1");
        }
        other => panic!("expected LocationConflict, got {other:?}"),
    }
    // The jobs container created before the conflict is gone again.
    assert_eq!(service.container_region("taken--jobs").await, None);
    assert!(matches!(store.config(), Err(StoreError::NotAttached(_))));

    let mut fresh = store_on(&service, "eu-west-1", "taken");
    assert!(matches!(
        fresh.resume().await,
        Err(StoreError::NoSuchJobStore(_))
    ));
}

#[tokio::test]
async fn test_transient_faults_are_retried() {
    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "local", "flaky");
    store.initialize(config()).await.unwrap();

    service.inject_transient_faults(3);
    let job = store.create(child_node("retry me")).await.unwrap();
    assert_eq!(store.load(&job.id).await.unwrap(), job);

    service.inject_transient_faults(2);
    let data = random_bytes(2 * PART as usize + 1);
    let (id, _) = write_stream(&store, None, &data).await;
    assert_eq!(read_back(&store, &id).await.unwrap(), data);

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_retries_give_up() {
    let service = MemoryObjectService::new();
    let backend = Arc::new(MemoryBackend::new(service.clone(), "local"));
    let mut store = ObjectJobStore::with_retry_policy(backend, "stubborn", RetryPolicy::none()).unwrap();

    service.inject_transient_faults(1);
    assert!(matches!(
        store.initialize(config()).await,
        Err(StoreError::Transient(_))
    ));
}

#[tokio::test]
async fn test_small_files_are_inlined() {
    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "local", "inline");
    store.initialize(config()).await.unwrap();

    let (small, _) = write_stream(&store, None, b"tiny").await;
    assert_eq!(service.object_count("inline--files").await, 0);

    let big = random_bytes(2048);
    let (large, _) = write_stream(&store, None, &big).await;
    assert_eq!(service.object_count("inline--files").await, 1);

    // Replacing content drops the old blob.
    let mut writer = store.update_file_stream(&large).await.unwrap();
    writer.write_all(&random_bytes(4096)).await.unwrap();
    writer.commit().await.unwrap();
    assert_eq!(service.object_count("inline--files").await, 1);

    store.delete_file(&large).await.unwrap();
    assert_eq!(service.object_count("inline--files").await, 0);

    // A public URL needs a blob, so the inline file gets one.
    let url = store.get_public_url(&small).await.unwrap();
    assert!(url.starts_with("mem://inline--files/"), "{url}");
    assert_eq!(service.object_count("inline--files").await, 1);
    assert_eq!(read_back(&store, &small).await.unwrap(), b"tiny");

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_sse_disables_inlining() {
    let service = MemoryObjectService::new();
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("sse.key");
    tokio::fs::write(&key_path, jobvault_core::EncryptionKey::generate().as_bytes())
        .await
        .unwrap();

    let mut store = store_on(&service, "local", "sealed");
    store
        .initialize(config().with_sse_key(&key_path))
        .await
        .unwrap();
    let (id, _) = write_stream(&store, None, b"tiny").await;
    assert_eq!(service.object_count("sealed--files").await, 1);
    assert_eq!(read_back(&store, &id).await.unwrap(), b"tiny");
    assert!(matches!(
        store.get_public_url(&id).await,
        Err(StoreError::Encryption(_))
    ));

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_overflow_blobs_are_cleaned_up() {
    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "local", "overflow");
    store.initialize(config()).await.unwrap();

    let mut job = store
        .create(child_node("big").with_name("x".repeat(600 * 1024)))
        .await
        .unwrap();
    assert_eq!(service.object_count("overflow--files").await, 1);

    // A new overflow blob replaces the old one.
    job.name = "y".repeat(600 * 1024);
    store.update(&mut job).await.unwrap();
    assert_eq!(service.object_count("overflow--files").await, 1);

    job.name = "small".to_string();
    store.update(&mut job).await.unwrap();
    assert_eq!(service.object_count("overflow--files").await, 0);
    assert_eq!(store.load(&job.id).await.unwrap(), job);

    job.name = "z".repeat(600 * 1024);
    store.update(&mut job).await.unwrap();
    store.delete(&job.id).await.unwrap();
    assert_eq!(service.object_count("overflow--files").await, 0);
    assert_eq!(service.object_count("overflow--jobs").await, 1, "only the config remains");

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_uploads_are_aborted() {
    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "local", "aborts");
    store.initialize(config()).await.unwrap();

    let (mut writer, id) = store.write_file_stream(None).await.unwrap();
    writer
        .write_all(&random_bytes(3 * PART as usize))
        .await
        .unwrap();
    // Let the background task flush parts before the writer is dropped.
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(writer);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(service.pending_uploads().await, 0);
    assert_eq!(service.object_count("aborts--files").await, 0);
    assert!(!store.file_exists(&id).await.unwrap());

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_public_shared_url_is_stable() {
    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "local", "public");
    store.initialize(config()).await.unwrap();

    let writer = store.write_shared_file_stream("report.html", false).await.unwrap();
    writer.write_all_and_commit(b"<p>v1</p>").await.unwrap();
    let first = store.get_shared_public_url("report.html").await.unwrap();

    let writer = store.write_shared_file_stream("report.html", false).await.unwrap();
    writer.write_all_and_commit(b"<p>v2</p>").await.unwrap();
    let second = store.get_shared_public_url("report.html").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(service.object_count("public--files").await, 1);

    // Switching to protected moves the content away from the public key.
    let writer = store.write_shared_file_stream("report.html", true).await.unwrap();
    writer.write_all_and_commit(&random_bytes(4096)).await.unwrap();
    assert_eq!(service.object_count("public--files").await, 1);
    let url = jobvault_core::url::parse_url(&first).unwrap();
    assert!(!store.url_registry().exists(&url).await.unwrap());

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_part_size_below_backend_minimum() {
    let service = MemoryObjectService::new();
    let backend = MemoryBackend::new(service.clone(), "local").with_min_part_size(4 * PART);
    let mut store =
        ObjectJobStore::with_retry_policy(Arc::new(backend), "min-part", quick_retries()).unwrap();

    match store.initialize(config()).await {
        Err(StoreError::Config(msg)) => assert!(msg.contains("part_size"), "{msg}"),
        other => panic!("expected Config error, got {other:?}"),
    }

    let large = config().with_part_size(4 * PART);
    store.initialize(large.clone()).await.unwrap();
    let data = random_bytes(9 * PART as usize + 5);
    let (id, _) = write_stream(&store, None, &data).await;
    assert_eq!(read_back(&store, &id).await.unwrap(), data);

    assert!(matches!(
        store.reconfigure(config()).await,
        Err(StoreError::Config(_))
    ));
    assert_eq!(store.config().unwrap(), &large);

    store.destroy().await.unwrap();
}

#[tokio::test]
async fn test_job_enumeration_pages_lazily() {
    use futures::{StreamExt, TryStreamExt};

    let service = MemoryObjectService::new();
    let mut store = store_on(&service, "local", "paged");
    store.initialize(config()).await.unwrap();

    let mut batch = store.batch();
    for i in 0..2007 {
        batch.create(child_node(&format!("paged-{i}")));
    }
    batch.flush().await.unwrap();

    let before = service.list_requests();
    let mut jobs = store.jobs();
    jobs.next().await.unwrap().unwrap();
    assert_eq!(service.list_requests() - before, 1);

    let rest: Vec<_> = jobs.try_collect().await.unwrap();
    assert_eq!(rest.len(), 2006);
    assert_eq!(service.list_requests() - before, 3);

    store.destroy().await.unwrap();
}

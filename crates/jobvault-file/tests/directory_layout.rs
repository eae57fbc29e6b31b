//! Behaviour specific to the directory layout.

use jobvault_core::{JobNode, JobStore, Requirements, StoreConfig};
use jobvault_file::FileJobStore;
use tempfile::TempDir;

async fn store(dir: &TempDir) -> FileJobStore {
    let mut store = FileJobStore::new(dir.path().join("store")).unwrap();
    store.initialize(StoreConfig::default()).await.unwrap();
    store
}

#[tokio::test]
async fn test_file_ids_keep_basename() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    let job = store
        .create(JobNode::new("cmd", Requirements::default()))
        .await
        .unwrap();

    let local = dir.path().join("results.tar.gz");
    tokio::fs::write(&local, b"payload").await.unwrap();

    let owned = store.write_file(&local, Some(&job.id)).await.unwrap();
    assert!(owned.as_str().starts_with("jobs/"));
    assert!(owned.as_str().ends_with("/results.tar.gz"));

    let unowned = store.write_file(&local, None).await.unwrap();
    assert!(unowned.as_str().starts_with("files/no-job/"));
    assert!(unowned.as_str().ends_with("/results.tar.gz"));
    assert_ne!(owned, unowned);

    let on_disk = store.root().join(unowned.as_str());
    assert_eq!(tokio::fs::read(on_disk).await.unwrap(), b"payload");
}

#[tokio::test]
async fn test_file_ids_cannot_escape_root() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    tokio::fs::write(dir.path().join("outside"), b"secret").await.unwrap();

    for id in ["../outside", "files/no-job/../../../outside", "/etc/passwd", "shared"] {
        let id = jobvault_core::FileId::new(id);
        assert!(!store.file_exists(&id).await.unwrap(), "{id} resolved");
        assert!(store.read_file_stream(&id).await.is_err());
    }
}

#[tokio::test]
async fn test_purged_stats_stay_readable_with_read_all() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    store
        .write_stats_and_logging(bytes::Bytes::from_static(b"one"))
        .await
        .unwrap();

    let purged = store
        .read_stats_and_logging(&mut |_: bytes::Bytes| {}, false)
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(store.root().join("stats")).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".read"));

    let mut all = Vec::new();
    let n = store
        .read_stats_and_logging(&mut |b: bytes::Bytes| all.push(b), true)
        .await
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(all[0].as_ref(), b"one");
}

#[tokio::test]
async fn test_config_is_plain_json() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    let raw = tokio::fs::read(store.root().join("config.json")).await.unwrap();
    let config: StoreConfig = serde_json::from_slice(&raw).unwrap();
    assert_eq!(&config, store.config().unwrap());
}

#[tokio::test]
async fn test_deleted_file_leaves_no_directory_after_update() {
    use tokio::io::AsyncWriteExt;

    let dir = TempDir::new().unwrap();
    let store = store(&dir).await;
    let local = dir.path().join("input.bin");
    tokio::fs::write(&local, b"first").await.unwrap();
    let id = store.write_file(&local, None).await.unwrap();
    let file_dir = store.root().join(id.as_str()).parent().unwrap().to_path_buf();

    let mut writer = store.update_file_stream(&id).await.unwrap();
    writer.write_all(b"second").await.unwrap();
    store.delete_file(&id).await.unwrap();
    assert!(matches!(
        writer.commit().await,
        Err(jobvault_core::StoreError::NoSuchFile(_))
    ));

    assert!(!file_dir.exists());
}

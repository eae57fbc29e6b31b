//! Stores of different backends opened through one context exchange files
//! by URL.

use jobvault::{JobStore, MemoryObjectService, OpenContext, StoreConfig, StoreError};
use jobvault_conformance::support::{random_bytes, read_back, write_shared, write_stream};
use tempfile::TempDir;

fn config() -> StoreConfig {
    StoreConfig::default()
        .with_part_size(64 * 1024)
        .with_inline_threshold(1024)
}

struct Pair {
    _dir: TempDir,
    file: Box<dyn JobStore>,
    mem: Box<dyn JobStore>,
}

async fn pair(tag: &str) -> Pair {
    let ctx = OpenContext::default().with_memory_service(MemoryObjectService::new());
    let dir = TempDir::new().unwrap();
    let locator = format!("file:{}", dir.path().join("store").display());

    let mut file = jobvault::open(&locator, &ctx).await.unwrap();
    file.initialize(config()).await.unwrap();
    let mut mem = jobvault::open(&format!("mem:local:{tag}"), &ctx)
        .await
        .unwrap();
    mem.initialize(config()).await.unwrap();
    Pair {
        _dir: dir,
        file,
        mem,
    }
}

/// Every direction of import between the two backends.
#[tokio::test]
async fn test_import_matrix() {
    let p = pair("matrix").await;
    let stores: [(&str, &dyn JobStore); 2] = [("file", p.file.as_ref()), ("mem", p.mem.as_ref())];

    for (source_name, source) in stores {
        for (target_name, target) in stores {
            for len in [0, 100, 3 * 64 * 1024 + 5] {
                let data = random_bytes(len);
                let (id, _) = write_stream(source, None, &data).await;
                let url = source.get_public_url(&id).await.unwrap();
                let imported = target.import_file(&url, None, None).await.unwrap().unwrap();
                assert_eq!(
                    read_back(target, &imported).await.unwrap(),
                    data,
                    "{source_name} -> {target_name}, {len} bytes"
                );
            }
        }
    }

    p.file.destroy().await.unwrap();
    p.mem.destroy().await.unwrap();
}

#[tokio::test]
async fn test_shared_file_crosses_backends() {
    let p = pair("shared").await;
    write_shared(p.mem.as_ref(), "settings.json", false, b"{\"retries\":3}").await;
    let url = p.mem.get_shared_public_url("settings.json").await.unwrap();
    assert!(url.starts_with("mem://"), "{url}");

    p.file
        .import_file(&url, None, Some("settings.json"))
        .await
        .unwrap();
    let content = p
        .file
        .read_shared_file_stream("settings.json")
        .await
        .unwrap()
        .read_to_vec()
        .await
        .unwrap();
    assert_eq!(content, b"{\"retries\":3}");

    p.file.destroy().await.unwrap();
    p.mem.destroy().await.unwrap();
}

#[tokio::test]
async fn test_export_into_object_container() {
    let p = pair("export").await;
    let data = random_bytes(200 * 1024);
    let (id, _) = write_stream(p.file.as_ref(), None, &data).await;

    // Export lands as a plain object next to the memory store's blobs.
    p.file
        .export_file(&id, "mem://export--files/exports/copy.bin")
        .await
        .unwrap();
    let imported = p
        .mem
        .import_file("mem://export--files/exports/copy.bin", None, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_back(p.mem.as_ref(), &imported).await.unwrap(), data);

    match p
        .file
        .export_file(&id, "mem://no-such-container/copy.bin")
        .await
    {
        Err(StoreError::NoSuchFile(_)) => {}
        other => panic!("expected NoSuchFile, got {other:?}"),
    }

    p.file.destroy().await.unwrap();
    p.mem.destroy().await.unwrap();
}

#[tokio::test]
async fn test_resume_through_open() {
    let ctx = OpenContext::default().with_memory_service(MemoryObjectService::new());
    let mut store = jobvault::open("mem:local:resumable", &ctx).await.unwrap();
    store.initialize(config()).await.unwrap();
    let job = store
        .create(jobvault_conformance::support::child_node("resume me"))
        .await
        .unwrap();

    let mut again = jobvault::open(&store.locator(), &ctx).await.unwrap();
    again.resume().await.unwrap();
    assert_eq!(again.load(&job.id).await.unwrap(), job);
    assert_eq!(again.config().unwrap(), store.config().unwrap());

    let mut twice = jobvault::open("mem:local:resumable", &ctx).await.unwrap();
    assert!(matches!(
        twice.initialize(config()).await,
        Err(StoreError::JobStoreExists(_))
    ));

    store.destroy().await.unwrap();
}

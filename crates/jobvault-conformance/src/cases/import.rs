//! Import and export through URLs.

use jobvault_core::StoreError;
use jobvault_core::url::Url;

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized};
use crate::support::{
    assert_no_such_file, create_job, interesting_sizes, random_bytes, read_back, read_shared,
    summary_of, write_shared, write_stream,
};

pub async fn import_local(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let owner = create_job(store.as_ref(), "importer").await;
    let part = fixture.config().part_size as usize;

    for size in interesting_sizes(part) {
        let data = random_bytes(size);
        let local = fixture.scratch().join(format!("import-{size}.bin"));
        tokio::fs::write(&local, &data).await.unwrap();

        let by_path = store
            .import_file(&local.to_string_lossy(), Some(&owner.id), None)
            .await
            .unwrap()
            .unwrap();
        let file_url = Url::from_file_path(&local).unwrap().to_string();
        let by_url = store.import_file(&file_url, None, None).await.unwrap().unwrap();
        assert_eq!(read_back(store.as_ref(), &by_path).await.unwrap(), data);
        assert_eq!(read_back(store.as_ref(), &by_url).await.unwrap(), data);

        let exported = fixture.scratch().join(format!("export-{size}.bin"));
        store
            .export_file(&by_path, &exported.to_string_lossy())
            .await
            .unwrap();
        let round_trip = tokio::fs::read(&exported).await.unwrap();
        assert_eq!(summary_of(&round_trip), summary_of(&data), "{size} bytes");
    }

    let missing = fixture.scratch().join("never-written.bin");
    assert_no_such_file(
        store
            .import_file(&missing.to_string_lossy(), None, None)
            .await,
    );

    store.destroy().await.unwrap();
}

pub async fn import_http(fixture: &dyn StoreFixture, external: &ExternalStores) {
    let store = initialized(fixture).await;
    let http = external.http().await;
    let part = fixture.config().part_size as usize;

    for size in [0, part + 1] {
        let data = random_bytes(size);
        let name = format!("in/{size}.bin");
        http.insert(&name, data.clone());

        let id = store
            .import_file(&http.url(&name), None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), data);

        let out = format!("out/{size}.bin");
        store.export_file(&id, &http.url(&out)).await.unwrap();
        assert_eq!(http.get(&out).unwrap().as_ref(), data.as_slice());
    }

    assert_no_such_file(store.import_file(&http.url("in/missing"), None, None).await);

    store.destroy().await.unwrap();
}

pub async fn import_ftp(fixture: &dyn StoreFixture, external: &ExternalStores) {
    let store = initialized(fixture).await;
    let ftp = external.ftp().await;
    let part = fixture.config().part_size as usize;

    for size in [1, 2 * part] {
        let data = random_bytes(size);
        let name = format!("pub/{size}.bin");
        ftp.insert(&name, data.clone());

        let id = store
            .import_file(&ftp.url(&name), None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), data);

        let out = format!("incoming/{size}.bin");
        store.export_file(&id, &ftp.url(&out)).await.unwrap();
        assert_eq!(ftp.get(&out).unwrap().as_ref(), data.as_slice());
    }

    assert_no_such_file(store.import_file(&ftp.url("pub/missing"), None, None).await);

    store.destroy().await.unwrap();
}

pub async fn import_from_other_store(fixture: &dyn StoreFixture, external: &ExternalStores) {
    let store = initialized(fixture).await;
    let other = external.secondary(fixture).await;

    let data = random_bytes(fixture.config().part_size as usize + 7);
    let (source_id, _) = write_stream(other.as_ref(), None, &data).await;
    let url = other.get_public_url(&source_id).await.unwrap();
    let id = store.import_file(&url, None, None).await.unwrap().unwrap();
    assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), data);

    write_shared(other.as_ref(), "published", false, b"shared across stores").await;
    let url = other.get_shared_public_url("published").await.unwrap();
    let id = store.import_file(&url, None, None).await.unwrap().unwrap();
    assert_eq!(
        read_back(store.as_ref(), &id).await.unwrap(),
        b"shared across stores"
    );

    match store.import_file("gopher://example.invalid/x", None, None).await {
        Err(StoreError::UnsupportedUrl(_)) => {}
        other => panic!("expected UnsupportedUrl, got {other:?}"),
    }

    store.destroy().await.unwrap();
}

pub async fn import_into_shared_file(fixture: &dyn StoreFixture, external: &ExternalStores) {
    let store = initialized(fixture).await;
    let http = external.http().await;
    http.insert("config/workflow.yaml", b"steps: 3\n".to_vec());

    let imported = store
        .import_file(&http.url("config/workflow.yaml"), None, Some("workflow.yaml"))
        .await
        .unwrap();
    assert!(imported.is_none());
    assert_eq!(
        read_shared(store.as_ref(), "workflow.yaml").await.unwrap(),
        b"steps: 3\n"
    );

    store.destroy().await.unwrap();
}

//! Name-keyed shared files.

use jobvault_core::StoreError;
use jobvault_core::url::parse_url;

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, resumed};
use crate::support::{assert_no_such_file, random_bytes, read_shared, write_shared};

pub async fn shared_file_isolation(fixture: &dyn StoreFixture, external: &ExternalStores) {
    let store = initialized(fixture).await;
    let worker = resumed(fixture, store.as_ref()).await;
    let neighbour = external.secondary(fixture).await;

    write_shared(store.as_ref(), "config.pickle", true, b"first").await;
    assert_eq!(read_shared(worker.as_ref(), "config.pickle").await.unwrap(), b"first");

    write_shared(worker.as_ref(), "config.pickle", true, b"second").await;
    assert_eq!(read_shared(store.as_ref(), "config.pickle").await.unwrap(), b"second");

    assert_no_such_file(read_shared(neighbour.as_ref(), "config.pickle").await);
    assert_no_such_file(read_shared(store.as_ref(), "never-written").await);

    // Shared files live on after every job is gone.
    let job = store.create(crate::support::child_node("temp")).await.unwrap();
    store.delete(&job.id).await.unwrap();
    assert_eq!(read_shared(worker.as_ref(), "config.pickle").await.unwrap(), b"second");

    store.destroy().await.unwrap();
}

pub async fn shared_public_url(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let data = random_bytes(4096);
    write_shared(store.as_ref(), "public.bin", false, &data).await;

    let url = store.get_shared_public_url("public.bin").await.unwrap();
    let url = parse_url(&url).unwrap();
    let mut reader = store.url_registry().open_read(&url).await.unwrap();
    let mut fetched = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut fetched)
        .await
        .unwrap();
    assert_eq!(fetched, data);

    assert!(matches!(
        store.get_shared_public_url("not-there").await,
        Err(StoreError::NoSuchFile(_))
    ));

    store.destroy().await.unwrap();
}

pub async fn shared_name_rules(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;

    for bad in ["", "..", "a/b", "white space"] {
        match store.write_shared_file_stream(bad, true).await {
            Err(StoreError::InvalidName { .. }) => {}
            Err(e) => panic!("{bad:?}: expected InvalidName, got {e:?}"),
            Ok(_) => panic!("{bad:?} was accepted as a shared file name"),
        }
        assert_no_such_file(read_shared(store.as_ref(), bad).await);
    }

    store.destroy().await.unwrap();
}

//! Server-side and client-side encryption toggles.

use jobvault_core::{StoreConfig, StoreError, StoreResult};

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, key_file, resumed};
use crate::support::{random_bytes, read_back, read_shared, write_shared, write_stream};

#[track_caller]
fn assert_key_missing<T: std::fmt::Debug>(result: StoreResult<T>) {
    match result {
        Err(StoreError::EncryptionKeyMissing) => {}
        other => panic!("expected EncryptionKeyMissing, got {other:?}"),
    }
}

/// Write with `keyed`, drop the key, then restore it.
async fn toggle(fixture: &dyn StoreFixture, keyed: StoreConfig) {
    let mut store = initialized(fixture).await;
    let plain = fixture.config();
    let part = plain.part_size as usize;

    store.reconfigure(keyed.clone()).await.unwrap();
    let data = random_bytes(part + 100);
    let (id, _) = write_stream(store.as_ref(), None, &data).await;
    let small = random_bytes(17);
    let (small_id, _) = write_stream(store.as_ref(), None, &small).await;
    write_shared(store.as_ref(), "secret", true, b"protected").await;
    write_shared(store.as_ref(), "open", false, b"unprotected").await;

    // Another worker picks the keys up from the stored config.
    let worker = resumed(fixture, store.as_ref()).await;
    assert_eq!(read_back(worker.as_ref(), &id).await.unwrap(), data);

    store.reconfigure(plain).await.unwrap();
    assert_key_missing(read_back(store.as_ref(), &id).await);
    assert_key_missing(read_back(store.as_ref(), &small_id).await);
    assert_key_missing(read_shared(store.as_ref(), "secret").await);
    assert_eq!(read_shared(store.as_ref(), "open").await.unwrap(), b"unprotected");

    store.reconfigure(keyed).await.unwrap();
    assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), data);
    assert_eq!(read_back(store.as_ref(), &small_id).await.unwrap(), small);
    assert_eq!(read_shared(store.as_ref(), "secret").await.unwrap(), b"protected");

    store.destroy().await.unwrap();
}

pub async fn cse_toggle(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let key = key_file(fixture, "cse.key").await;
    toggle(fixture, fixture.config().with_cse_key(key)).await;
}

pub async fn sse_toggle(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    if !fixture.supports_sse() {
        tracing::info!(backend = fixture.name(), "Backend has no server-side encryption");
        return;
    }
    let key = key_file(fixture, "sse.key").await;
    toggle(fixture, fixture.config().with_sse_key(key)).await;
}

pub async fn wrong_key(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let mut store = initialized(fixture).await;
    let first = key_file(fixture, "first.key").await;
    let second = key_file(fixture, "second.key").await;

    store
        .reconfigure(fixture.config().with_cse_key(first))
        .await
        .unwrap();
    let (id, _) = write_stream(store.as_ref(), None, &random_bytes(5000)).await;

    store
        .reconfigure(fixture.config().with_cse_key(second))
        .await
        .unwrap();
    match read_back(store.as_ref(), &id).await {
        Err(StoreError::Encryption(_)) => {}
        other => panic!("expected an encryption error, got {other:?}"),
    }

    store.destroy().await.unwrap();
}

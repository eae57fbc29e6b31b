//! Streaming and multipart integrity.

use std::time::Duration;

use jobvault_core::StoreError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, resumed};
use crate::support::{
    assert_no_such_file, interesting_sizes, random_bytes, read_back, summary_of, update_stream,
    write_stream,
};

pub async fn stream_sizes(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let reader = resumed(fixture, store.as_ref()).await;
    let part = fixture.config().part_size as usize;

    for size in interesting_sizes(part) {
        let data = random_bytes(size);
        let (id, summary) = write_stream(store.as_ref(), None, &data).await;
        assert_eq!(summary, summary_of(&data), "summary for {size} bytes");
        assert_eq!(
            read_back(reader.as_ref(), &id).await.unwrap(),
            data,
            "content of {size} bytes"
        );

        // One large write gives the same summary as many small ones.
        let (mut writer, whole_id) = store.write_file_stream(None).await.unwrap();
        writer.write_all(&data).await.unwrap();
        assert_eq!(writer.commit().await.unwrap(), summary);
        assert_eq!(read_back(reader.as_ref(), &whole_id).await.unwrap(), data);

        let replacement = random_bytes(size / 2 + 3);
        let updated = update_stream(store.as_ref(), &id, &replacement).await;
        assert_eq!(updated, summary_of(&replacement));
        assert_eq!(read_back(reader.as_ref(), &id).await.unwrap(), replacement);
    }

    store.destroy().await.unwrap();
}

pub async fn partial_read_does_not_block(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let part = fixture.config().part_size as usize;
    // Several times what the read pipeline buffers ahead of a reader.
    let data = random_bytes((2 * part + 17).max(4 * 1024 * 1024 + 17));
    let (id, _) = write_stream(store.as_ref(), None, &data).await;

    tokio::time::timeout(Duration::from_secs(45), async {
        let mut reader = store.read_file_stream(&id).await.unwrap();
        let mut head = [0u8; 10];
        reader.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..], &data[..10]);

        // The parked reader must not hold up writers.
        let more = random_bytes(part + 1);
        let (other, _) = write_stream(store.as_ref(), None, &more).await;
        assert_eq!(read_back(store.as_ref(), &other).await.unwrap(), more);

        drop(reader);
        let replacement = random_bytes(part);
        update_stream(store.as_ref(), &id, &replacement).await;
        assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), replacement);
    })
    .await
    .expect("partial read blocked the store");

    store.destroy().await.unwrap();
}

pub async fn abandoned_writer(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let part = fixture.config().part_size as usize;

    let (mut writer, id) = store.write_file_stream(None).await.unwrap();
    writer.write_all(&random_bytes(2 * part + 5)).await.unwrap();
    drop(writer);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!store.file_exists(&id).await.unwrap());
    assert_no_such_file(read_back(store.as_ref(), &id).await);

    let original = random_bytes(part + 9);
    let (kept, _) = write_stream(store.as_ref(), None, &original).await;
    let mut updater = store.update_file_stream(&kept).await.unwrap();
    updater.write_all(&random_bytes(3 * part)).await.unwrap();
    drop(updater);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(read_back(store.as_ref(), &kept).await.unwrap(), original);

    store.destroy().await.unwrap();
}

pub async fn missing_file_streams(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let (id, _) = write_stream(store.as_ref(), None, b"short lived").await;
    store.delete_file(&id).await.unwrap();

    assert_no_such_file(read_back(store.as_ref(), &id).await);
    assert!(matches!(
        store.get_public_url(&id).await,
        Err(StoreError::NoSuchFile(_))
    ));
    match store.update_file_stream(&id).await {
        Err(StoreError::NoSuchFile(_)) => {}
        Err(e) => panic!("expected NoSuchFile, got {e:?}"),
        Ok(_) => panic!("opened an updater for a deleted file"),
    }

    store.destroy().await.unwrap();
}

//! Job-scoped and unowned files.

use jobvault_core::{FileId, JobId, StoreError};
use tokio::io::AsyncWriteExt;

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, resumed};
use crate::support::{
    assert_no_such_file, create_job, random_bytes, read_back, update_stream, write_stream,
};

pub async fn file_lifecycle(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let worker = resumed(fixture, store.as_ref()).await;
    let job = create_job(store.as_ref(), "owner").await;

    let local = fixture.scratch().join("lifecycle-input.bin");
    let original = random_bytes(3000);
    tokio::fs::write(&local, &original).await.unwrap();

    let id = store.write_file(&local, Some(&job.id)).await.unwrap();
    assert!(worker.file_exists(&id).await.unwrap());

    let out = fixture.scratch().join("lifecycle-output.bin");
    worker.read_file(&id, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), original);

    let replacement = random_bytes(7000);
    tokio::fs::write(&local, &replacement).await.unwrap();
    worker.update_file(&id, &local).await.unwrap();
    assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), replacement);

    store.delete_file(&id).await.unwrap();
    store.delete_file(&id).await.unwrap();
    assert!(!worker.file_exists(&id).await.unwrap());
    assert_no_such_file(read_back(worker.as_ref(), &id).await);

    let missing_out = fixture.scratch().join("lifecycle-missing.bin");
    assert_no_such_file(worker.read_file(&id, &missing_out).await);
    assert!(!missing_out.exists());

    store.destroy().await.unwrap();
}

pub async fn empty_files(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;

    let id = store.get_empty_file_id(None).await.unwrap();
    assert!(store.file_exists(&id).await.unwrap());
    assert!(read_back(store.as_ref(), &id).await.unwrap().is_empty());

    let out = fixture.scratch().join("empty-output.bin");
    store.read_file(&id, &out).await.unwrap();
    assert_eq!(tokio::fs::metadata(&out).await.unwrap().len(), 0);

    let empty_local = fixture.scratch().join("empty-input");
    tokio::fs::write(&empty_local, b"").await.unwrap();
    let from_empty = store.write_file(&empty_local, None).await.unwrap();
    assert!(read_back(store.as_ref(), &from_empty).await.unwrap().is_empty());

    // An empty file can be filled later.
    let data = random_bytes(42);
    update_stream(store.as_ref(), &id, &data).await;
    assert_eq!(read_back(store.as_ref(), &id).await.unwrap(), data);

    store.destroy().await.unwrap();
}

pub async fn job_owned_files_released(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let a = create_job(store.as_ref(), "a").await;
    let b = create_job(store.as_ref(), "b").await;

    let (of_a, _) = write_stream(store.as_ref(), Some(&a.id), &random_bytes(2000)).await;
    let empty_of_a = store.get_empty_file_id(Some(&a.id)).await.unwrap();
    let b_data = random_bytes(2000);
    let (of_b, _) = write_stream(store.as_ref(), Some(&b.id), &b_data).await;
    let free_data = random_bytes(20);
    let (free, _) = write_stream(store.as_ref(), None, &free_data).await;

    store.delete(&a.id).await.unwrap();

    assert_no_such_file(read_back(store.as_ref(), &of_a).await);
    assert!(!store.file_exists(&of_a).await.unwrap());
    assert!(!store.file_exists(&empty_of_a).await.unwrap());
    assert_eq!(read_back(store.as_ref(), &of_b).await.unwrap(), b_data);
    assert_eq!(read_back(store.as_ref(), &free).await.unwrap(), free_data);

    store.destroy().await.unwrap();
}

pub async fn file_owner_must_exist(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let ghost = JobId::new("no-such-owner");

    match store.write_file_stream(Some(&ghost)).await {
        Err(StoreError::NoSuchJob(_)) => {}
        Err(e) => panic!("expected NoSuchJob, got {e:?}"),
        Ok((_, id)) => panic!("created {id} for a missing owner"),
    }

    match store.update_file_stream(&FileId::new("files/no-job/missing/stream")).await {
        Err(StoreError::NoSuchFile(_)) => {}
        Err(e) => panic!("expected NoSuchFile, got {e:?}"),
        Ok(_) => panic!("opened an updater for a missing file"),
    }

    store.destroy().await.unwrap();
}

pub async fn update_of_deleted_file(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let part = fixture.config().part_size as usize;

    for size in [12, 2 * part + 3] {
        let (id, _) = write_stream(store.as_ref(), None, &random_bytes(100)).await;
        let mut writer = store.update_file_stream(&id).await.unwrap();
        let data = random_bytes(size);
        let (head, tail) = data.split_at(size / 2);
        writer.write_all(head).await.unwrap();

        store.delete_file(&id).await.unwrap();
        writer.write_all(tail).await.unwrap();
        match writer.commit().await {
            Err(StoreError::NoSuchFile(_)) => {}
            other => panic!("update of a deleted file ({size} bytes): {other:?}"),
        }
        assert!(!store.file_exists(&id).await.unwrap());
        assert_no_such_file(read_back(store.as_ref(), &id).await);
    }

    store.destroy().await.unwrap();
}

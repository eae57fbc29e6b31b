//! The two-phase update and its recovery sweep.

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, resumed};
use crate::support::{assert_no_such_file, create_job, random_bytes, read_back, write_stream};

pub async fn staged_deletions_on_update(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let mut job = create_job(store.as_ref(), "stager").await;

    let (doomed, _) = write_stream(store.as_ref(), Some(&job.id), &random_bytes(100)).await;
    let (unowned, _) = write_stream(store.as_ref(), None, &random_bytes(5000)).await;
    let keep_data = random_bytes(10);
    let (kept, _) = write_stream(store.as_ref(), Some(&job.id), &keep_data).await;

    job.files_to_delete = vec![doomed.clone(), unowned.clone()];
    store.update(&mut job).await.unwrap();

    assert!(job.files_to_delete.is_empty());
    assert!(!store.file_exists(&doomed).await.unwrap());
    assert!(!store.file_exists(&unowned).await.unwrap());
    assert_no_such_file(read_back(store.as_ref(), &unowned).await);
    assert_eq!(read_back(store.as_ref(), &kept).await.unwrap(), keep_data);

    let reloaded = store.load(&job.id).await.unwrap();
    assert!(reloaded.files_to_delete.is_empty());
    assert_eq!(reloaded, job);

    store.destroy().await.unwrap();
}

pub async fn staged_deletions_recovered(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let mut crashed = create_job(store.as_ref(), "crashed").await;
    let bystander = create_job(store.as_ref(), "bystander").await;

    let (a, _) = write_stream(store.as_ref(), None, &random_bytes(10)).await;
    let (b, _) = write_stream(store.as_ref(), Some(&crashed.id), &random_bytes(10)).await;

    // Phase one only, as if the process died right after it.
    crashed.files_to_delete = vec![a.clone(), b.clone()];
    store.persist(&crashed).await.unwrap();

    let restarted = resumed(fixture, store.as_ref()).await;
    let seen = restarted.load(&crashed.id).await.unwrap();
    assert_eq!(seen.files_to_delete, vec![a.clone(), b.clone()]);
    assert!(restarted.file_exists(&a).await.unwrap());

    assert_eq!(restarted.recover_staged_deletions().await.unwrap(), 1);
    assert!(!restarted.file_exists(&a).await.unwrap());
    assert!(!restarted.file_exists(&b).await.unwrap());
    assert!(
        restarted
            .load(&crashed.id)
            .await
            .unwrap()
            .files_to_delete
            .is_empty()
    );
    assert_eq!(restarted.load(&bystander.id).await.unwrap(), bystander);

    // Nothing left to repair.
    assert_eq!(restarted.recover_staged_deletions().await.unwrap(), 0);

    // Deleting a job with staged files releases them as well.
    let (c, _) = write_stream(store.as_ref(), None, &random_bytes(10)).await;
    let mut victim = create_job(store.as_ref(), "victim").await;
    victim.files_to_delete = vec![c.clone()];
    store.persist(&victim).await.unwrap();
    store.delete(&victim.id).await.unwrap();
    assert!(!store.file_exists(&c).await.unwrap());

    store.destroy().await.unwrap();
}

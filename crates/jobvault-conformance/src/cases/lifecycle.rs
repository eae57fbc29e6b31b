//! Store lifecycle, the root job and `clean`.

use std::collections::HashMap;

use jobvault_core::StoreError;

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized};
use crate::support::{
    assert_no_such_job, child_node, create_job, parent_node, random_bytes, write_shared,
    write_stream,
};

pub async fn destroy_idempotent(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    // Never initialized.
    let untouched = fixture.fresh().await.unwrap();
    untouched.destroy().await.unwrap();
    untouched.destroy().await.unwrap();

    let store = initialized(fixture).await;
    let job = create_job(store.as_ref(), "doomed").await;
    write_stream(store.as_ref(), Some(&job.id), &random_bytes(3 * 1024)).await;
    write_stream(store.as_ref(), None, &random_bytes(10)).await;
    write_shared(store.as_ref(), "leftover", true, b"x").await;
    store
        .write_stats_and_logging(bytes::Bytes::from_static(b"{}"))
        .await
        .unwrap();

    store.destroy().await.unwrap();
    store.destroy().await.unwrap();

    let mut reopened = fixture.reopen(&store.locator()).await.unwrap();
    assert!(matches!(
        reopened.resume().await,
        Err(StoreError::NoSuchJobStore(_))
    ));

    // The location can be initialized again from scratch.
    reopened.initialize(fixture.config()).await.unwrap();
    assert!(!reopened.exists(&job.id).await.unwrap());
    reopened.destroy().await.unwrap();
}

pub async fn root_job_and_clean(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;

    assert_no_such_job(store.load_root_job().await);
    let stray = create_job(store.as_ref(), "stray").await;
    assert!(store.clean(None).await.unwrap().is_empty());
    assert!(store.exists(&stray.id).await.unwrap());

    let mut root = store.create_root_job(parent_node()).await.unwrap();
    assert_eq!(store.load_root_job().await.unwrap(), root);

    let mut child = create_job(store.as_ref(), "child").await;
    let grandchild = create_job(store.as_ref(), "grandchild").await;
    child.push_successors([grandchild.to_ref()]);
    store.update(&mut child).await.unwrap();
    root.push_successors([child.to_ref()]);
    store.update(&mut root).await.unwrap();
    let orphan = store.create(child_node("orphan")).await.unwrap();

    let mut expected = vec![stray.id.clone(), orphan.id.clone()];
    expected.sort();
    assert_eq!(store.clean(None).await.unwrap(), expected);
    for kept in [&root, &child, &grandchild] {
        assert!(store.exists(&kept.id).await.unwrap(), "{} was cleaned", kept.id);
    }
    assert!(!store.exists(&orphan.id).await.unwrap());

    // With a cache only cached jobs are candidates.
    let late_orphan = create_job(store.as_ref(), "late-orphan").await;
    let uncached_orphan = create_job(store.as_ref(), "uncached-orphan").await;
    let cache: HashMap<_, _> = [&root, &child, &grandchild, &late_orphan]
        .into_iter()
        .map(|job| (job.id.clone(), job.clone()))
        .collect();
    assert_eq!(
        store.clean(Some(&cache)).await.unwrap(),
        vec![late_orphan.id.clone()]
    );
    assert!(!store.exists(&late_orphan.id).await.unwrap());
    assert!(store.exists(&uncached_orphan.id).await.unwrap());

    store.destroy().await.unwrap();
}

//! Job records: round trip, isolation, deletion, enumeration and batching.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::TryStreamExt;
use jobvault_core::{JobDescription, JobId, JobStore, StoreError};
use serde_json::json;

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, resumed};
use crate::support::{assert_no_such_job, child_node, create_job, parent_node};

pub async fn job_round_trip(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let master = initialized(fixture).await;
    let worker = resumed(fixture, master.as_ref()).await;

    let mut parent = master.create(parent_node()).await.unwrap();
    assert_eq!(parent.command, "parent1");
    assert_eq!(parent.requirements.memory, 12);
    assert_eq!(parent.requirements.cores, 34.0);
    assert_eq!(parent.requirements.disk, 35);
    assert!(parent.requirements.preemptable);
    assert_eq!(parent.name, "test1");
    assert_eq!(parent.unit_name.as_deref(), Some("onParent"));
    assert!(parent.stack.is_empty());
    assert!(parent.predecessors_finished.is_empty());
    assert!(parent.files_to_delete.is_empty());
    assert!(master.exists(&parent.id).await.unwrap());

    // Loading twice gives equal but independent values.
    let mut first = worker.load(&parent.id).await.unwrap();
    let second = worker.load(&parent.id).await.unwrap();
    assert_eq!(first, parent);
    assert_eq!(first, second);
    first.name.push_str("-changed");
    assert_ne!(first, second);

    let child = master.create(child_node("child1")).await.unwrap();
    parent.push_successors([child.to_ref()]);
    parent.set_attribute("checkpoint", json!({"step": 3, "tags": ["a", "b"]}));
    master.update(&mut parent).await.unwrap();

    let reloaded = worker.load(&parent.id).await.unwrap();
    assert_eq!(reloaded, parent);
    assert_eq!(reloaded.successor_ids().collect::<Vec<_>>(), vec![&child.id]);
    assert_eq!(reloaded.stack[0][0].command, "child1");
    assert_eq!(
        reloaded.attribute("checkpoint"),
        Some(&json!({"step": 3, "tags": ["a", "b"]}))
    );

    master.destroy().await.unwrap();
}

pub async fn config_round_trip(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let mut store = fixture.fresh().await.unwrap();
    assert!(matches!(
        store.resume().await,
        Err(StoreError::NoSuchJobStore(_))
    ));

    let config = fixture.config();
    store.initialize(config.clone()).await.unwrap();
    assert_eq!(store.config().unwrap(), &config);

    let other = resumed(fixture, store.as_ref()).await;
    assert_eq!(other.config().unwrap(), &config);

    let mut again = fixture.reopen(&store.locator()).await.unwrap();
    assert!(matches!(
        again.initialize(config).await,
        Err(StoreError::JobStoreExists(_))
    ));

    store.destroy().await.unwrap();
}

pub async fn update_isolation(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let master = initialized(fixture).await;
    let worker = resumed(fixture, master.as_ref()).await;

    let mut a = create_job(master.as_ref(), "a").await;
    let b = create_job(master.as_ref(), "b").await;

    a.command = "a-updated".to_string();
    a.remaining_retry_count = 7;
    a.predecessors_finished.insert(b.id.clone());
    worker.update(&mut a).await.unwrap();

    assert_eq!(master.load(&a.id).await.unwrap(), a);
    assert_eq!(master.load(&b.id).await.unwrap(), b);

    master.destroy().await.unwrap();
}

pub async fn delete_idempotent_without_cascade(
    fixture: &dyn StoreFixture,
    _external: &ExternalStores,
) {
    let store = initialized(fixture).await;

    let mut parent = store.create(parent_node()).await.unwrap();
    let child = create_job(store.as_ref(), "child").await;
    parent.push_successors([child.to_ref()]);
    store.update(&mut parent).await.unwrap();

    store.delete(&parent.id).await.unwrap();
    assert!(!store.exists(&parent.id).await.unwrap());
    assert_no_such_job(store.load(&parent.id).await);
    store.delete(&parent.id).await.unwrap();

    assert_eq!(store.load(&child.id).await.unwrap(), child);

    // Deleting an ID that never existed is fine too.
    store.delete(&JobId::new("never-created")).await.unwrap();
    assert!(!store.exists(&JobId::new("never-created")).await.unwrap());

    store.destroy().await.unwrap();
}

pub async fn persist_missing_job(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;

    let mut job = create_job(store.as_ref(), "doomed").await;
    store.delete(&job.id).await.unwrap();
    job.command = "resurrected".to_string();
    assert_no_such_job(store.update(&mut job).await);
    assert!(!store.exists(&job.id).await.unwrap());

    store.destroy().await.unwrap();
}

pub async fn job_enumeration(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    assert!(store.jobs().try_collect::<Vec<_>>().await.unwrap().is_empty());

    let mut created = Vec::new();
    for i in 0..10 {
        created.push(create_job(store.as_ref(), &format!("job-{i}")).await);
    }
    let gone = created.remove(3);
    store.delete(&gone.id).await.unwrap();

    let listed: Vec<_> = store.jobs().try_collect().await.unwrap();
    assert_eq!(listed.len(), created.len());
    for job in &created {
        assert!(listed.contains(job), "{} missing from enumeration", job.id);
    }
    assert!(listed.iter().all(|j| j.id != gone.id));

    store.destroy().await.unwrap();
}

pub async fn batch_creates(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;

    let mut batch = store.batch();
    let queued: Vec<_> = (0..5)
        .map(|i| batch.create(child_node(&format!("batched-{i}"))))
        .collect();
    assert_eq!(batch.len(), 5);
    for job in &queued {
        assert!(!store.exists(&job.id).await.unwrap());
    }
    let flushed = batch.flush().await.unwrap();
    assert_eq!(flushed, queued);
    for job in &queued {
        assert_eq!(&store.load(&job.id).await.unwrap(), job);
    }

    let ids: HashSet<_> = queued.iter().map(|j| &j.id).collect();
    assert_eq!(ids.len(), queued.len());

    // A batch dropped before flushing stores nothing.
    let dropped = {
        let mut batch = store.batch();
        batch.create(child_node("never"))
    };
    assert!(!store.exists(&dropped.id).await.unwrap());

    store.destroy().await.unwrap();
}

pub async fn concurrent_creates(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let master = initialized(fixture).await;
    let worker = resumed(fixture, master.as_ref()).await;

    let creates = (0..32).map(|i| {
        let store = if i % 2 == 0 { &master } else { &worker };
        store.create(child_node(&format!("concurrent-{i}")))
    });
    let jobs = futures::future::try_join_all(creates).await.unwrap();

    let ids: HashSet<_> = jobs.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids.len(), jobs.len());
    for job in &jobs {
        assert_eq!(&master.load(&job.id).await.unwrap(), job);
    }

    master.destroy().await.unwrap();
}

pub async fn overlarge_job_records(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let reader = resumed(fixture, store.as_ref()).await;

    let mut job = store
        .create(parent_node().with_name("x".repeat(512 * 1024)))
        .await
        .unwrap();
    assert_eq!(reader.load(&job.id).await.unwrap(), job);

    // Shrink below any record limit, then grow past it through an attribute.
    job.name = "small".to_string();
    store.update(&mut job).await.unwrap();
    assert_eq!(reader.load(&job.id).await.unwrap(), job);

    job.set_attribute("blob", json!("y".repeat(500_000)));
    store.update(&mut job).await.unwrap();
    assert_eq!(reader.load(&job.id).await.unwrap(), job);

    let listed: Vec<_> = reader.jobs().try_collect().await.unwrap();
    assert_eq!(listed, vec![job.clone()]);

    store.delete(&job.id).await.unwrap();
    assert!(!reader.exists(&job.id).await.unwrap());

    store.destroy().await.unwrap();
}

/// Apply `versions` in order, yielding between updates.
async fn rewrite(store: &dyn JobStore, versions: &[JobDescription]) {
    for version in versions {
        let mut version = version.clone();
        store.update(&mut version).await.unwrap();
        tokio::task::yield_now().await;
    }
}

/// Load `id` until `done` is set; every load must be a whole version.
async fn watch(
    store: &dyn JobStore,
    id: &JobId,
    versions: &[JobDescription],
    done: &AtomicBool,
) -> usize {
    let mut loads = 0;
    loop {
        let seen = store.load(id).await.unwrap();
        assert!(
            versions.contains(&seen),
            "load returned a mix of versions (name {:?})",
            seen.name
        );
        loads += 1;
        if done.load(Ordering::SeqCst) {
            return loads;
        }
        tokio::task::yield_now().await;
    }
}

pub async fn update_atomic_for_readers(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let store = initialized(fixture).await;
    let worker = resumed(fixture, store.as_ref()).await;
    let reader = resumed(fixture, store.as_ref()).await;
    let job = store.create(child_node("contended")).await.unwrap();

    // Every third version is too large for a single object-store record.
    let versions: Vec<JobDescription> = (0..12)
        .map(|round| {
            let mut version = job.clone();
            version.name = format!("round-{round}");
            version.set_attribute("round", json!(round));
            if round % 3 == 1 {
                version.set_attribute("bulk", json!("z".repeat(450_000)));
            }
            version
        })
        .collect();
    let (even, odd): (Vec<_>, Vec<_>) = versions
        .iter()
        .cloned()
        .enumerate()
        .partition(|(i, _)| i % 2 == 0);
    let even: Vec<_> = even.into_iter().map(|(_, v)| v).collect();
    let odd: Vec<_> = odd.into_iter().map(|(_, v)| v).collect();
    let mut allowed = versions.clone();
    allowed.push(job.clone());

    let done = AtomicBool::new(false);
    let writers = async {
        futures::join!(
            rewrite(store.as_ref(), &even),
            rewrite(worker.as_ref(), &odd)
        );
        done.store(true, Ordering::SeqCst);
    };
    let ((), master_loads, reader_loads) = futures::join!(
        writers,
        watch(store.as_ref(), &job.id, &allowed, &done),
        watch(reader.as_ref(), &job.id, &allowed, &done)
    );
    assert!(master_loads > 0 && reader_loads > 0);

    let last = reader.load(&job.id).await.unwrap();
    assert!(last == even[even.len() - 1] || last == odd[odd.len() - 1]);

    store.destroy().await.unwrap();
}

//! The write-many, read-once stats and logging channel.

use std::collections::HashSet;

use bytes::Bytes;

use crate::external::ExternalStores;
use crate::fixture::{StoreFixture, initialized, resumed};

pub async fn stats_read_and_purge(fixture: &dyn StoreFixture, _external: &ExternalStores) {
    let leader = initialized(fixture).await;
    let worker = resumed(fixture, leader.as_ref()).await;

    let first: Vec<Bytes> = (0..3)
        .map(|i| Bytes::from(format!("{{\"worker\": {i}}}")))
        .collect();
    for blob in &first {
        worker.write_stats_and_logging(blob.clone()).await.unwrap();
    }

    let mut seen = Vec::new();
    let n = leader
        .read_stats_and_logging(&mut |blob: Bytes| seen.push(blob), false)
        .await
        .unwrap();
    assert_eq!(n, first.len());
    assert_eq!(as_set(&seen), as_set(&first));

    let again = leader
        .read_stats_and_logging(&mut |_: Bytes| panic!("purged record delivered"), false)
        .await
        .unwrap();
    assert_eq!(again, 0);

    let second: Vec<Bytes> = (0..2)
        .map(|i| Bytes::from(format!("{{\"late\": {i}}}")))
        .collect();
    for blob in &second {
        worker.write_stats_and_logging(blob.clone()).await.unwrap();
    }

    let mut everything = Vec::new();
    let all = leader
        .read_stats_and_logging(&mut |blob: Bytes| everything.push(blob), true)
        .await
        .unwrap();
    assert_eq!(all, first.len() + second.len());
    let expected: Vec<Bytes> = first.iter().chain(&second).cloned().collect();
    assert_eq!(as_set(&everything), as_set(&expected));

    // Reading everything purges nothing.
    let mut late = Vec::new();
    let unread = leader
        .read_stats_and_logging(&mut |blob: Bytes| late.push(blob), false)
        .await
        .unwrap();
    assert_eq!(unread, second.len());
    assert_eq!(as_set(&late), as_set(&second));

    leader.destroy().await.unwrap();
}

fn as_set(blobs: &[Bytes]) -> HashSet<Bytes> {
    blobs.iter().cloned().collect()
}

//! Small helpers shared by the cases.

use jobvault_core::multipart::ContentHasher;
use jobvault_core::{
    ContentSummary, FileId, JobDescription, JobId, JobNode, JobStore, Requirements, StoreError,
    StoreResult,
};
use rand::RngCore;
use tokio::io::AsyncWriteExt;

/// Write chunk size used by the cases; deliberately not a divisor of the
/// part size.
pub const ODD_CHUNK: usize = 1000;

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn summary_of(data: &[u8]) -> ContentSummary {
    ContentHasher::summarize(data)
}

/// The node used by the round-trip scenario.
pub fn parent_node() -> JobNode {
    JobNode::new("parent1", Requirements::new(12, 34.0, 35, true))
        .with_name("test1")
        .with_unit_name("onParent")
}

pub fn child_node(command: &str) -> JobNode {
    JobNode::new(command, Requirements::new(23, 45.0, 46, true))
        .with_name("test2")
        .with_unit_name("onChild1")
        .with_predecessor_number(1)
}

pub async fn create_job(store: &dyn JobStore, command: &str) -> JobDescription {
    store.create(child_node(command)).await.unwrap()
}

/// Stream `data` into a new file in odd-sized chunks.
pub async fn write_stream(
    store: &dyn JobStore,
    owner: Option<&JobId>,
    data: &[u8],
) -> (FileId, ContentSummary) {
    let (mut writer, id) = store.write_file_stream(owner).await.unwrap();
    for chunk in data.chunks(ODD_CHUNK) {
        writer.write_all(chunk).await.unwrap();
    }
    let summary = writer.commit().await.unwrap();
    (id, summary)
}

/// Replace a file's content through a stream.
pub async fn update_stream(store: &dyn JobStore, id: &FileId, data: &[u8]) -> ContentSummary {
    let mut writer = store.update_file_stream(id).await.unwrap();
    for chunk in data.chunks(ODD_CHUNK) {
        writer.write_all(chunk).await.unwrap();
    }
    writer.commit().await.unwrap()
}

pub async fn read_back(store: &dyn JobStore, id: &FileId) -> StoreResult<Vec<u8>> {
    store.read_file_stream(id).await?.read_to_vec().await
}

pub async fn read_shared(store: &dyn JobStore, name: &str) -> StoreResult<Vec<u8>> {
    store.read_shared_file_stream(name).await?.read_to_vec().await
}

pub async fn write_shared(store: &dyn JobStore, name: &str, protected: bool, data: &[u8]) {
    let writer = store
        .write_shared_file_stream(name, protected)
        .await
        .unwrap();
    writer.write_all_and_commit(data).await.unwrap();
}

/// Assert that a read failed because the file is missing, whether the
/// failure surfaced on open or on the first byte.
#[track_caller]
pub fn assert_no_such_file<T: std::fmt::Debug>(result: StoreResult<T>) {
    match result {
        Err(StoreError::NoSuchFile(_)) => {}
        other => panic!("expected NoSuchFile, got {other:?}"),
    }
}

#[track_caller]
pub fn assert_no_such_job<T: std::fmt::Debug>(result: StoreResult<T>) {
    match result {
        Err(StoreError::NoSuchJob(_)) => {}
        other => panic!("expected NoSuchJob, got {other:?}"),
    }
}

/// Interesting content sizes around the part size.
pub fn interesting_sizes(part: usize) -> [usize; 6] {
    [0, 1, part - 1, part, part + 1, 2 * part]
}

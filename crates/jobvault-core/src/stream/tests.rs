use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;
use crate::crypto::{EncryptionKey, Opener, Sealer};
use crate::error::StoreError;
use crate::multipart::ContentHasher;

#[derive(Default)]
struct Recorded {
    parts: Vec<(u32, Bytes)>,
    tail: Option<Bytes>,
    summary: Option<UploadSummary>,
    aborted: bool,
}

struct RecordingSink(Arc<Mutex<Recorded>>);

#[async_trait]
impl ContentSink for RecordingSink {
    async fn put_part(&mut self, index: u32, part: Bytes) -> StoreResult<()> {
        self.0.lock().unwrap().parts.push((index, part));
        Ok(())
    }

    async fn complete(self: Box<Self>, tail: Bytes, summary: UploadSummary) -> StoreResult<()> {
        let mut rec = self.0.lock().unwrap();
        rec.tail = Some(tail);
        rec.summary = Some(summary);
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        self.0.lock().unwrap().aborted = true;
    }
}

fn stored(rec: &Recorded) -> Vec<u8> {
    let mut out = Vec::new();
    for (_, part) in &rec.parts {
        out.extend_from_slice(part);
    }
    if let Some(tail) = &rec.tail {
        out.extend_from_slice(tail);
    }
    out
}

fn options(part_size: u64, sealer: Option<Sealer>) -> WriteOptions {
    WriteOptions {
        part_size,
        sealer,
        label: "test".to_string(),
    }
}

/// Yields the stored bytes in fixed-size chunks, forever if asked to.
struct ChunkSource {
    data: Bytes,
    chunk: usize,
    endless: bool,
}

#[async_trait]
impl ContentSource for ChunkSource {
    async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        if self.endless {
            return Ok(Some(Bytes::from(vec![7u8; self.chunk])));
        }
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = self.chunk.min(self.data.len());
        Ok(Some(self.data.split_to(n)))
    }
}

struct MissingSource;

#[async_trait]
impl ContentSource for MissingSource {
    async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        Err(StoreError::NoSuchFile("gone".to_string()))
    }
}

#[tokio::test]
async fn test_write_splits_into_ordered_parts() {
    let rec = Arc::new(Mutex::new(Recorded::default()));
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

    let mut handle = WriteHandle::spawn(Box::new(RecordingSink(rec.clone())), options(300, None));
    for chunk in data.chunks(77) {
        handle.write_all(chunk).await.unwrap();
    }
    let summary = handle.commit().await.unwrap();

    let rec = rec.lock().unwrap();
    assert_eq!(summary, ContentHasher::summarize(&data));
    let indexes: Vec<u32> = rec.parts.iter().map(|(i, _)| *i).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(rec.tail.as_ref().unwrap().len(), 100);
    assert_eq!(stored(&rec), data);
    let upload = rec.summary.as_ref().unwrap();
    assert_eq!(upload.parts_flushed, 3);
    assert_eq!(upload.stored_size, 1000);
    assert!(!upload.client_encrypted);
    assert!(!rec.aborted);
}

#[tokio::test]
async fn test_empty_stream_commits_empty_tail() {
    let rec = Arc::new(Mutex::new(Recorded::default()));
    let handle = WriteHandle::spawn(Box::new(RecordingSink(rec.clone())), options(16, None));
    let summary = handle.commit().await.unwrap();

    let rec = rec.lock().unwrap();
    assert_eq!(summary.size, 0);
    assert!(rec.parts.is_empty());
    assert_eq!(rec.tail.as_deref(), Some(&b""[..]));
}

#[tokio::test]
async fn test_dropped_writer_aborts_sink() {
    let rec = Arc::new(Mutex::new(Recorded::default()));
    let mut handle = WriteHandle::spawn(Box::new(RecordingSink(rec.clone())), options(4, None));
    handle.write_all(b"some bytes that span parts").await.unwrap();
    drop(handle);

    for _ in 0..100 {
        if rec.lock().unwrap().aborted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let rec = rec.lock().unwrap();
    assert!(rec.aborted);
    assert!(rec.summary.is_none());
}

#[tokio::test]
async fn test_enveloped_write_then_read() {
    let key = EncryptionKey::generate();
    let rec = Arc::new(Mutex::new(Recorded::default()));
    let data = vec![3u8; 200_000];

    let handle = WriteHandle::spawn(
        Box::new(RecordingSink(rec.clone())),
        options(50_000, Some(Sealer::new(&key))),
    );
    let summary = handle.write_all_and_commit(&data).await.unwrap();
    assert_eq!(summary, ContentHasher::summarize(&data));

    let stored_bytes = stored(&rec.lock().unwrap());
    assert_ne!(stored_bytes.len(), data.len());
    assert!(rec.lock().unwrap().summary.as_ref().unwrap().client_encrypted);

    let source = ChunkSource {
        data: Bytes::from(stored_bytes.clone()),
        chunk: 4096,
        endless: false,
    };
    let out = ReadHandle::spawn(Box::new(source), Opener::new(Some(key)))
        .read_to_vec()
        .await
        .unwrap();
    assert_eq!(out, data);

    let err = ReadHandle::from_stored(Bytes::from(stored_bytes), Opener::new(None))
        .read_to_vec()
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::EncryptionKeyMissing));
}

#[tokio::test]
async fn test_partial_read_does_not_block() {
    let source = ChunkSource {
        data: Bytes::new(),
        chunk: 64 * 1024,
        endless: true,
    };
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let mut reader = ReadHandle::spawn(Box::new(source), Opener::new(None));
        let mut buf = [0u8; 100];
        reader.read_exact(&mut buf).await.unwrap();
        drop(reader);
        buf
    })
    .await
    .unwrap();
    assert_eq!(result, [7u8; 100]);
}

#[tokio::test]
async fn test_missing_file_surfaces_through_read() {
    let mut reader = ReadHandle::spawn(Box::new(MissingSource), Opener::new(None));
    let mut buf = Vec::new();
    let io_err = reader.read_to_end(&mut buf).await.unwrap_err();
    assert_eq!(io_err.kind(), std::io::ErrorKind::NotFound);
    assert!(matches!(StoreError::from(io_err), StoreError::NoSuchFile(_)));
}

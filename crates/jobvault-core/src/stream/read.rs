use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{CHANNEL_DEPTH, ContentSource};
use crate::crypto::Opener;
use crate::error::StoreResult;

/// Readable end of a file stream.
///
/// A background task pulls stored chunks from the backend, opens any
/// client-side envelope and forwards plaintext through a bounded channel.
/// Dropping the handle stops the task, so reading only a prefix of a file
/// is always safe. Backend errors surface from `poll_read` as `io::Error`
/// values that convert back into the original
/// [`StoreError`](crate::StoreError) with `?`.
pub struct ReadHandle {
    rx: mpsc::Receiver<StoreResult<Bytes>>,
    chunk: Bytes,
    done: bool,
    task: JoinHandle<()>,
}

impl ReadHandle {
    /// Start streaming from `source`, opening envelopes with `opener`.
    pub fn spawn(source: Box<dyn ContentSource>, opener: Opener) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = tokio::spawn(run_download(source, opener, tx));
        Self {
            rx,
            chunk: Bytes::new(),
            done: false,
            task,
        }
    }

    /// Stream stored bytes held in memory.
    pub fn from_stored(stored: Bytes, opener: Opener) -> Self {
        Self::spawn(Box::new(BytesSource::new(stored)), opener)
    }

    /// Read the remaining stream into memory.
    pub async fn read_to_vec(mut self) -> StoreResult<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(out)
    }
}

impl AsyncRead for ReadHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                let head = self.chunk.split_to(n);
                buf.put_slice(&head);
                return Poll::Ready(Ok(()));
            }
            if self.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => {
                    self.done = true;
                    return Poll::Ready(Err(e.into_io()));
                }
                None => self.done = true,
            }
        }
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_download(
    mut source: Box<dyn ContentSource>,
    mut opener: Opener,
    tx: mpsc::Sender<StoreResult<Bytes>>,
) {
    loop {
        let plaintext = match source.next_chunk().await {
            Ok(Some(stored)) => opener.open(&stored),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        match plaintext {
            Ok(p) if p.is_empty() => {}
            Ok(p) => {
                if tx.send(Ok(Bytes::from(p))).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
    match opener.finish() {
        Ok(rest) if rest.is_empty() => {}
        Ok(rest) => {
            let _ = tx.send(Ok(Bytes::from(rest))).await;
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
    }
}

/// A [`ContentSource`] over bytes already in memory (inlined content).
pub struct BytesSource {
    remaining: Option<Bytes>,
}

impl BytesSource {
    pub fn new(data: Bytes) -> Self {
        Self {
            remaining: Some(data),
        }
    }
}

#[async_trait]
impl ContentSource for BytesSource {
    async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>> {
        Ok(self.remaining.take().filter(|b| !b.is_empty()))
    }
}

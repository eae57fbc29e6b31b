use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

use super::{CHANNEL_DEPTH, ContentSink, UploadSummary};
use crate::crypto::Sealer;
use crate::error::{StoreError, StoreResult};
use crate::file::ContentSummary;
use crate::multipart::{ContentHasher, PartSplitter};

enum Frame {
    Data(Bytes),
    Finish,
}

/// Upload parameters chosen by the backend.
pub struct WriteOptions {
    /// Stored bytes per part.
    pub part_size: u64,

    /// Envelope writer when client-side encryption is on.
    pub sealer: Option<Sealer>,

    /// Label used in log events (usually the file ID or shared name).
    pub label: String,
}

/// Writable end of a file stream.
///
/// Bytes written here are checksummed, optionally enveloped, split into
/// parts and handed to the backend by a background task while the caller
/// keeps writing. Nothing becomes visible until [`commit`](Self::commit)
/// succeeds. Dropping the handle without committing cancels the upload and
/// the task discards whatever was stored.
pub struct WriteHandle {
    sender: PollSender<Frame>,
    finisher: mpsc::Sender<Frame>,
    task: Option<JoinHandle<StoreResult<ContentSummary>>>,
    label: String,
}

impl WriteHandle {
    /// Start an upload into `sink`.
    pub fn spawn(sink: Box<dyn ContentSink>, options: WriteOptions) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let label = options.label.clone();
        let task = tokio::spawn(run_upload(rx, sink, options));
        Self {
            sender: PollSender::new(tx.clone()),
            finisher: tx,
            task: Some(task),
            label,
        }
    }

    /// Finish the stream and wait until the content is durable.
    ///
    /// Returns the size and SHA-256 of the plaintext written.
    pub async fn commit(mut self) -> StoreResult<ContentSummary> {
        let task = self
            .task
            .take()
            .ok_or_else(|| StoreError::Internal("write handle already committed".to_string()))?;
        if self.finisher.send(Frame::Finish).await.is_err() {
            tracing::debug!(stream = %self.label, "Upload task stopped before commit");
        }
        task.await?
    }

    /// Write a whole buffer and commit.
    pub async fn write_all_and_commit(mut self, data: &[u8]) -> StoreResult<ContentSummary> {
        use tokio::io::AsyncWriteExt;
        self.write_all(data).await?;
        self.commit().await
    }

    fn stopped(&self) -> io::Error {
        StoreError::StreamAborted(format!("upload of {} stopped", self.label)).into_io()
    }
}

impl AsyncWrite for WriteHandle {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(self.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(self.stopped()));
        }
        let data = Bytes::copy_from_slice(buf);
        if self.sender.send_item(Frame::Data(data)).is_err() {
            return Poll::Ready(Err(self.stopped()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            tracing::warn!(stream = %self.label, "Write handle dropped without commit, discarding upload");
        }
    }
}

async fn run_upload(
    mut rx: mpsc::Receiver<Frame>,
    mut sink: Box<dyn ContentSink>,
    options: WriteOptions,
) -> StoreResult<ContentSummary> {
    let WriteOptions {
        part_size,
        mut sealer,
        label,
    } = options;
    let client_encrypted = sealer.is_some();
    let mut hasher = ContentHasher::new();
    let mut splitter = PartSplitter::new(part_size);
    let mut stored_size = 0u64;

    let received: StoreResult<()> = async {
        loop {
            let data = match rx.recv().await {
                Some(Frame::Data(data)) => data,
                Some(Frame::Finish) => return Ok(()),
                None => {
                    return Err(StoreError::StreamAborted(format!(
                        "{label} was dropped before commit"
                    )));
                }
            };
            hasher.update(&data);
            let stored = match sealer.as_mut() {
                Some(sealer) => Bytes::from(sealer.seal(&data)?),
                None => data,
            };
            stored_size += stored.len() as u64;
            push_parts(sink.as_mut(), &mut splitter, &stored).await?;
        }
    }
    .await;

    if let Err(e) = received {
        sink.abort().await;
        return Err(e);
    }
    rx.close();

    if let Some(sealer) = sealer.take() {
        let tail = match sealer.finish() {
            Ok(tail) => tail,
            Err(e) => {
                sink.abort().await;
                return Err(e);
            }
        };
        stored_size += tail.len() as u64;
        if let Err(e) = push_parts(sink.as_mut(), &mut splitter, &tail).await {
            sink.abort().await;
            return Err(e);
        }
    }

    let content = hasher.finish();
    let summary = UploadSummary {
        content: content.clone(),
        stored_size,
        parts_flushed: splitter.flushed(),
        client_encrypted,
    };
    sink.complete(splitter.finish(), summary).await?;
    tracing::debug!(stream = %label, size = content.size, sha256 = %content.sha256, "Upload committed");
    Ok(content)
}

async fn push_parts(
    sink: &mut dyn ContentSink,
    splitter: &mut PartSplitter,
    data: &[u8],
) -> StoreResult<()> {
    let first = splitter.flushed();
    for (offset, part) in splitter.push(data).into_iter().enumerate() {
        sink.put_part(first + offset as u32, part).await?;
    }
    Ok(())
}

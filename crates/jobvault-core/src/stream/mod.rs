//! Streaming file I/O.
//!
//! Writers and readers are capability-typed handles: a [`WriteHandle`] only
//! implements [`AsyncWrite`](tokio::io::AsyncWrite), a [`ReadHandle`] only
//! implements [`AsyncRead`](tokio::io::AsyncRead). Each side is backed by a
//! spawned task connected over a bounded channel, so neither side ever holds
//! a whole file in memory and a reader that stops early never blocks the
//! storage side.
//!
//! Backends plug in through [`ContentSink`] (where written parts go) and
//! [`ContentSource`] (where stored chunks come from).

mod read;
mod write;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreResult;
use crate::file::ContentSummary;

pub use read::{BytesSource, ReadHandle};
pub use write::{WriteHandle, WriteOptions};

/// Channel depth between a handle and its task.
pub(crate) const CHANNEL_DEPTH: usize = 8;

/// Chunk size used by sources that read from local files.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// What the upload task reports to a sink once the stream is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// Size and checksum of the plaintext stream.
    pub content: ContentSummary,

    /// Bytes actually stored (after enveloping).
    pub stored_size: u64,

    /// Parts already handed to [`ContentSink::put_part`].
    pub parts_flushed: u32,

    /// Whether the stored bytes are a client-side envelope.
    pub client_encrypted: bool,
}

/// Destination of an upload.
///
/// Parts arrive in order with 0-based indexes. If the stream ends before a
/// full part was flushed, `complete` receives the whole stored content as
/// its tail and may store it inline or with a single put; otherwise the
/// tail is the last, non-empty part.
#[async_trait]
pub trait ContentSink: Send + 'static {
    /// Store one full part.
    async fn put_part(&mut self, index: u32, part: Bytes) -> StoreResult<()>;

    /// Store the tail and make the new content visible.
    async fn complete(self: Box<Self>, tail: Bytes, summary: UploadSummary) -> StoreResult<()>;

    /// Discard everything stored so far. Must not fail.
    async fn abort(self: Box<Self>);
}

/// Origin of a download. Yields stored bytes in order until `None`.
#[async_trait]
pub trait ContentSource: Send + 'static {
    async fn next_chunk(&mut self) -> StoreResult<Option<Bytes>>;
}

#[cfg(test)]
mod tests;

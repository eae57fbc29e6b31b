//! Part splitting and logical-stream checksumming.
//!
//! The upload engine feeds every written buffer through a [`ContentHasher`]
//! (over the plaintext) and a [`PartSplitter`] (over the stored bytes). The
//! splitter holds back the last part until the stream finishes, so a stream
//! of exactly `part_size` bytes is stored with a single put and the tail
//! handed to the sink is never empty once a part has been flushed.

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::file::ContentSummary;

/// Hex SHA-256 of the empty stream.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Incremental size and SHA-256 over a logical byte stream.
#[derive(Clone, Default)]
pub struct ContentHasher {
    digest: Sha256,
    size: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of the stream.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.size += data.len() as u64;
    }

    /// Bytes seen so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> ContentSummary {
        ContentSummary {
            size: self.size,
            sha256: hex::encode(self.digest.finalize()),
        }
    }

    /// Summary of a complete in-memory buffer.
    pub fn summarize(data: &[u8]) -> ContentSummary {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finish()
    }
}

/// Splits a byte stream into fixed-size parts.
#[derive(Debug)]
pub struct PartSplitter {
    part_size: usize,
    pending: BytesMut,
    flushed: u32,
}

impl PartSplitter {
    /// Create a splitter. A zero part size is treated as one byte.
    pub fn new(part_size: u64) -> Self {
        let part_size = usize::try_from(part_size).unwrap_or(usize::MAX).max(1);
        Self {
            part_size,
            pending: BytesMut::new(),
            flushed: 0,
        }
    }

    /// Append data and return every part that is now known not to be last.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut parts = Vec::new();
        while self.pending.len() > self.part_size {
            parts.push(self.pending.split_to(self.part_size).freeze());
        }
        self.flushed += parts.len() as u32;
        parts
    }

    /// Number of parts handed out by [`push`](Self::push).
    pub fn flushed(&self) -> u32 {
        self.flushed
    }

    /// Bytes buffered but not yet handed out.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take the remaining tail (at most one part).
    pub fn finish(self) -> Bytes {
        self.pending.freeze()
    }
}

/// Number of parts a stored object of `len` bytes is uploaded in.
pub fn part_count(len: u64, part_size: u64) -> u32 {
    let part_size = part_size.max(1);
    if len <= part_size {
        1
    } else {
        len.div_ceil(part_size) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_digest_constant() {
        assert_eq!(ContentHasher::new().finish().sha256, EMPTY_SHA256);
        assert_eq!(ContentHasher::summarize(b"").size, 0);
    }

    #[test]
    fn test_exact_part_is_held_back() {
        let mut splitter = PartSplitter::new(4);
        assert!(splitter.push(b"abcd").is_empty());
        assert_eq!(splitter.flushed(), 0);
        assert_eq!(splitter.finish(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn test_part_plus_one_flushes_one_part() {
        let mut splitter = PartSplitter::new(4);
        let parts = splitter.push(b"abcde");
        assert_eq!(parts, vec![Bytes::from_static(b"abcd")]);
        assert_eq!(splitter.finish(), Bytes::from_static(b"e"));
    }

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(0, 4), 1);
        assert_eq!(part_count(4, 4), 1);
        assert_eq!(part_count(5, 4), 2);
        assert_eq!(part_count(8, 4), 2);
        assert_eq!(part_count(9, 4), 3);
    }

    proptest! {
        #[test]
        fn prop_parts_concatenate_to_input(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            part_size in 1u64..300,
            cuts in proptest::collection::vec(0usize..2048, 0..8),
        ) {
            let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            bounds.push(0);
            bounds.push(data.len());
            bounds.sort_unstable();

            let mut splitter = PartSplitter::new(part_size);
            let mut hasher = ContentHasher::new();
            let mut out = Vec::new();
            for pair in bounds.windows(2) {
                let chunk = &data[pair[0]..pair[1]];
                hasher.update(chunk);
                for part in splitter.push(chunk) {
                    prop_assert_eq!(part.len() as u64, part_size);
                    out.extend_from_slice(&part);
                }
            }
            let flushed = splitter.flushed();
            let tail = splitter.finish();
            prop_assert!(tail.len() as u64 <= part_size);
            if flushed > 0 {
                prop_assert!(!tail.is_empty());
            }
            out.extend_from_slice(&tail);

            prop_assert_eq!(&out, &data);
            prop_assert_eq!(flushed + 1, part_count(data.len() as u64, part_size));
            prop_assert_eq!(hasher.finish(), ContentHasher::summarize(&data));
        }
    }
}

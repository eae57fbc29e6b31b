//! Encryption at rest.
//!
//! Two independent layers are configured from [`StoreConfig`](crate::StoreConfig)
//! key paths:
//!
//! - **SSE**: the key is handed to the backend, which encrypts on its side.
//!   Backends record the key [fingerprint](EncryptionKey::fingerprint) and
//!   refuse reads without a matching key.
//! - **CSE**: content is enveloped in-process before it leaves the writer.
//!
//! The CSE envelope is a 16 byte header (magic plus key fingerprint) followed
//! by AES-256-GCM frames of at most [`FRAME_SIZE`] plaintext bytes:
//!
//! ```text
//! [u32 BE ciphertext length][12 byte nonce][ciphertext + tag]
//! ```
//!
//! Each frame authenticates its index and whether it is the last frame, so
//! reordered, dropped or truncated frames fail to open.

use std::fmt;
use std::path::Path;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// Plaintext bytes per envelope frame.
pub const FRAME_SIZE: usize = 64 * 1024;

/// Envelope magic.
pub const ENVELOPE_MAGIC: &[u8; 8] = b"JVCSE\x01\x00\x00";

const FINGERPRINT_LEN: usize = 8;
const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + FINGERPRINT_LEN;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256-bit key loaded from a key file.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for EncryptionKey {}

impl EncryptionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parse key file contents: 32 raw bytes, or 64 hex characters.
    pub fn parse(contents: &[u8]) -> StoreResult<Self> {
        if let Ok(bytes) = <[u8; KEY_LEN]>::try_from(contents) {
            return Ok(Self { bytes });
        }
        let text = std::str::from_utf8(contents)
            .map(str::trim)
            .map_err(|_| StoreError::Config(format!("key must be {KEY_LEN} bytes")))?;
        let decoded = hex::decode(text)
            .map_err(|_| StoreError::Config(format!("key must be {KEY_LEN} bytes or hex")))?;
        let bytes = <[u8; KEY_LEN]>::try_from(decoded.as_slice())
            .map_err(|_| StoreError::Config(format!("key must be {KEY_LEN} bytes")))?;
        Ok(Self { bytes })
    }

    /// Load a key file.
    pub async fn load(path: &Path) -> StoreResult<Self> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Config(format!("cannot read key {}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    /// Load an optional key path.
    pub async fn load_optional(path: Option<&Path>) -> StoreResult<Option<Self>> {
        match path {
            Some(path) => Ok(Some(Self::load(path).await?)),
            None => Ok(None),
        }
    }

    /// Raw key material.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Hex SHA-256 of the key, safe to persist next to the content.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.bytes))
    }

    fn short_fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        let digest = Sha256::digest(self.bytes);
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        out
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }
}

/// Keys currently configured on a store handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRing {
    pub sse: Option<EncryptionKey>,
    pub cse: Option<EncryptionKey>,
}

impl KeyRing {
    /// Load both keys named by a config.
    pub async fn load(config: &crate::StoreConfig) -> StoreResult<Self> {
        Ok(Self {
            sse: EncryptionKey::load_optional(config.sse_key.as_deref()).await?,
            cse: EncryptionKey::load_optional(config.cse_key.as_deref()).await?,
        })
    }

    /// Envelope writer for new content, if CSE is on.
    pub fn sealer(&self) -> Option<Sealer> {
        self.cse.as_ref().map(Sealer::new)
    }

    /// Envelope reader for stored content.
    pub fn opener(&self) -> Opener {
        Opener::new(self.cse.clone())
    }

    /// Check that a blob written under `fingerprint` can be read.
    pub fn check_sse(&self, fingerprint: Option<&str>) -> StoreResult<()> {
        match (fingerprint, &self.sse) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(StoreError::EncryptionKeyMissing),
            (Some(fp), Some(key)) if key.fingerprint() == fp => Ok(()),
            (Some(_), Some(_)) => Err(StoreError::Encryption(
                "content was written with a different server-side key".to_string(),
            )),
        }
    }
}

fn frame_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(last);
    aad
}

/// Incremental envelope writer.
pub struct Sealer {
    cipher: Aes256Gcm,
    fingerprint: [u8; FINGERPRINT_LEN],
    pending: Vec<u8>,
    header_written: bool,
    index: u64,
}

impl Sealer {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: key.cipher(),
            fingerprint: key.short_fingerprint(),
            pending: Vec::new(),
            header_written: false,
            index: 0,
        }
    }

    fn header(&mut self, out: &mut Vec<u8>) {
        if !self.header_written {
            out.extend_from_slice(ENVELOPE_MAGIC);
            out.extend_from_slice(&self.fingerprint);
            self.header_written = true;
        }
    }

    fn frame(&mut self, plaintext: &[u8], last: bool, out: &mut Vec<u8>) -> StoreResult<()> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let aad = frame_aad(self.index, last);
        let ciphertext = self
            .cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| StoreError::Encryption(format!("AES-256-GCM encryption failed: {e}")))?;
        out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        self.index += 1;
        Ok(())
    }

    /// Seal more plaintext, returning whatever envelope bytes are ready.
    pub fn seal(&mut self, data: &[u8]) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        self.header(&mut out);
        self.pending.extend_from_slice(data);
        // Keep at least one byte back so the final frame is never empty
        // unless the whole stream is.
        while self.pending.len() > FRAME_SIZE {
            let rest = self.pending.split_off(FRAME_SIZE);
            let frame = std::mem::replace(&mut self.pending, rest);
            self.frame(&frame, false, &mut out)?;
        }
        Ok(out)
    }

    /// Seal the final frame.
    pub fn finish(mut self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        self.header(&mut out);
        let last = std::mem::take(&mut self.pending);
        self.frame(&last, true, &mut out)?;
        Ok(out)
    }

    /// Envelope a complete buffer.
    pub fn seal_all(key: &EncryptionKey, data: &[u8]) -> StoreResult<Vec<u8>> {
        let mut sealer = Sealer::new(key);
        let mut out = sealer.seal(data)?;
        out.extend(sealer.finish()?);
        Ok(out)
    }
}

enum OpenState {
    /// Waiting for enough bytes to recognise the header.
    Sniffing,
    /// Not an envelope: bytes pass through unchanged.
    Plain,
    /// Inside an envelope.
    Frames { cipher: Aes256Gcm, finished: bool },
}

/// Incremental envelope reader.
///
/// Streams that do not start with the envelope magic pass through unchanged,
/// so plaintext written before a key was configured stays readable.
pub struct Opener {
    key: Option<EncryptionKey>,
    state: OpenState,
    pending: Vec<u8>,
    index: u64,
}

impl Opener {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self {
            key,
            state: OpenState::Sniffing,
            pending: Vec::new(),
            index: 0,
        }
    }

    /// Feed stored bytes, returning the plaintext now available.
    pub fn open(&mut self, data: &[u8]) -> StoreResult<Vec<u8>> {
        if let OpenState::Plain = self.state {
            return Ok(data.to_vec());
        }
        self.pending.extend_from_slice(data);
        if let OpenState::Sniffing = self.state {
            if self.pending.len() < ENVELOPE_MAGIC.len() {
                if ENVELOPE_MAGIC.starts_with(&self.pending) {
                    return Ok(Vec::new());
                }
                return Ok(self.go_plain());
            }
            if !self.pending.starts_with(ENVELOPE_MAGIC) {
                return Ok(self.go_plain());
            }
            if self.pending.len() < HEADER_LEN {
                return Ok(Vec::new());
            }
            let key = self.key.as_ref().ok_or(StoreError::EncryptionKeyMissing)?;
            if self.pending[ENVELOPE_MAGIC.len()..HEADER_LEN] != key.short_fingerprint() {
                return Err(StoreError::Encryption(
                    "content was enveloped with a different client-side key".to_string(),
                ));
            }
            self.state = OpenState::Frames {
                cipher: key.cipher(),
                finished: false,
            };
            self.pending.drain(..HEADER_LEN);
        }
        self.open_frames()
    }

    fn go_plain(&mut self) -> Vec<u8> {
        self.state = OpenState::Plain;
        std::mem::take(&mut self.pending)
    }

    fn open_frames(&mut self) -> StoreResult<Vec<u8>> {
        let OpenState::Frames { cipher, finished } = &mut self.state else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let available = &self.pending[offset..];
            if available.is_empty() {
                break;
            }
            if *finished {
                return Err(StoreError::Encryption(
                    "trailing bytes after final frame".to_string(),
                ));
            }
            if available.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([available[0], available[1], available[2], available[3]])
                as usize;
            if len < TAG_LEN || len > FRAME_SIZE + TAG_LEN {
                return Err(StoreError::Encryption(format!("corrupt frame length {len}")));
            }
            let frame_len = 4 + NONCE_LEN + len;
            if available.len() < frame_len {
                break;
            }
            let nonce = &available[4..4 + NONCE_LEN];
            let ciphertext = &available[4 + NONCE_LEN..frame_len];
            let plaintext = match cipher.decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &frame_aad(self.index, false),
                },
            ) {
                Ok(p) => p,
                Err(_) => {
                    let p = cipher
                        .decrypt(
                            GenericArray::from_slice(nonce),
                            Payload {
                                msg: ciphertext,
                                aad: &frame_aad(self.index, true),
                            },
                        )
                        .map_err(|_| {
                            StoreError::Encryption("envelope authentication failed".to_string())
                        })?;
                    *finished = true;
                    p
                }
            };
            out.extend_from_slice(&plaintext);
            self.index += 1;
            offset += frame_len;
        }
        self.pending.drain(..offset);
        Ok(out)
    }

    /// End of stored stream: flush or verify completeness.
    pub fn finish(mut self) -> StoreResult<Vec<u8>> {
        match self.state {
            OpenState::Sniffing | OpenState::Plain => Ok(std::mem::take(&mut self.pending)),
            OpenState::Frames { finished, .. } => {
                if finished && self.pending.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(StoreError::Encryption("truncated envelope".to_string()))
                }
            }
        }
    }

    /// Open a complete stored buffer.
    pub fn open_all(key: Option<EncryptionKey>, data: &[u8]) -> StoreResult<Vec<u8>> {
        let mut opener = Opener::new(key);
        let mut out = opener.open(data)?;
        out.extend(opener.finish()?);
        Ok(out)
    }
}

/// Whether stored bytes start with the envelope magic.
pub fn is_enveloped(stored_prefix: &[u8]) -> bool {
    stored_prefix.starts_with(ENVELOPE_MAGIC)
}

/// Stored size of `len` plaintext bytes after enveloping.
pub fn enveloped_len(len: u64) -> u64 {
    let frame = FRAME_SIZE as u64;
    let frames = if len == 0 { 1 } else { len.div_ceil(frame) };
    HEADER_LEN as u64 + frames * (4 + NONCE_LEN + TAG_LEN) as u64 + len
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_raw_and_hex_keys() {
        let raw = [7u8; KEY_LEN];
        let a = EncryptionKey::parse(&raw).unwrap();
        let hex_key = format!("{}\n", hex::encode(raw));
        let b = EncryptionKey::parse(hex_key.as_bytes()).unwrap();
        assert_eq!(a, b);
        assert!(EncryptionKey::parse(b"too short").is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = EncryptionKey::from_bytes([0xab; KEY_LEN]);
        let debug = format!("{key:?}");
        assert!(!debug.contains(&"ab".repeat(KEY_LEN)));
        assert!(debug.contains(&key.fingerprint()));
    }

    #[test]
    fn test_empty_stream_roundtrip() {
        let key = EncryptionKey::generate();
        let sealed = Sealer::seal_all(&key, b"").unwrap();
        assert!(is_enveloped(&sealed));
        assert_eq!(sealed.len() as u64, enveloped_len(0));
        assert!(Opener::open_all(Some(key), &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_missing_key_is_reported() {
        let key = EncryptionKey::generate();
        let sealed = Sealer::seal_all(&key, b"secret").unwrap();
        let err = Opener::open_all(None, &sealed).unwrap_err();
        assert!(matches!(err, StoreError::EncryptionKeyMissing));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = Sealer::seal_all(&EncryptionKey::generate(), b"secret").unwrap();
        let err = Opener::open_all(Some(EncryptionKey::generate()), &sealed).unwrap_err();
        assert!(matches!(err, StoreError::Encryption(_)));
    }

    #[test]
    fn test_plaintext_passes_through_with_key() {
        let data = b"written before the key was configured";
        let out = Opener::open_all(Some(EncryptionKey::generate()), data).unwrap();
        assert_eq!(out, data);
        assert_eq!(Opener::open_all(None, b"JV").unwrap(), b"JV");
    }

    #[test]
    fn test_truncated_envelope_fails() {
        let key = EncryptionKey::generate();
        let data = vec![1u8; FRAME_SIZE * 2 + 10];
        let sealed = Sealer::seal_all(&key, &data).unwrap();
        let frame_len = 4 + NONCE_LEN + FRAME_SIZE + TAG_LEN;
        let cut = &sealed[..HEADER_LEN + frame_len * 2];
        let err = Opener::open_all(Some(key), cut).unwrap_err();
        assert!(matches!(err, StoreError::Encryption(_)));
    }

    #[test]
    fn test_sse_check() {
        let key = EncryptionKey::generate();
        let ring = KeyRing {
            sse: Some(key.clone()),
            cse: None,
        };
        assert!(ring.check_sse(None).is_ok());
        assert!(ring.check_sse(Some(&key.fingerprint())).is_ok());
        assert!(matches!(
            KeyRing::default().check_sse(Some(&key.fingerprint())),
            Err(StoreError::EncryptionKeyMissing)
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_envelope_survives_any_chunking(
            len in 0usize..(FRAME_SIZE * 2 + 100),
            write_chunk in 1usize..50_000,
            read_chunk in 1usize..50_000,
        ) {
            let key = EncryptionKey::from_bytes([42u8; KEY_LEN]);
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            let mut sealer = Sealer::new(&key);
            let mut sealed = Vec::new();
            for chunk in data.chunks(write_chunk) {
                sealed.extend(sealer.seal(chunk).unwrap());
            }
            sealed.extend(sealer.finish().unwrap());
            prop_assert_eq!(sealed.len() as u64, enveloped_len(len as u64));

            let mut opener = Opener::new(Some(key));
            let mut out = Vec::new();
            for chunk in sealed.chunks(read_chunk) {
                out.extend(opener.open(chunk).unwrap());
            }
            out.extend(opener.finish().unwrap());
            prop_assert_eq!(out, data);
        }
    }
}

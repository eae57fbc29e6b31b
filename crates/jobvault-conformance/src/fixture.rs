//! The per-backend hook the suite is parameterized over.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jobvault_core::{EncryptionKey, JobStore, StoreConfig, StoreResult};

/// Part size used by every suite store, small enough to exercise multipart
/// uploads with modest test data.
pub const SUITE_PART_SIZE: u64 = 64 * 1024;

/// Inline threshold used by every suite store.
pub const SUITE_INLINE_THRESHOLD: u64 = 1024;

/// Creates store handles for one backend.
#[async_trait]
pub trait StoreFixture: Send + Sync {
    /// Backend name, used in assertion messages.
    fn name(&self) -> &'static str;

    /// A detached handle at a fresh, unique location.
    async fn fresh(&self) -> StoreResult<Box<dyn JobStore>>;

    /// A second detached handle for the store at `locator`.
    async fn reopen(&self, locator: &str) -> StoreResult<Box<dyn JobStore>>;

    /// Scratch directory for local files and key files.
    fn scratch(&self) -> &Path;

    /// Whether the backend honours `sse_key`.
    fn supports_sse(&self) -> bool {
        true
    }

    /// Config the suite initializes stores with.
    fn config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_part_size(SUITE_PART_SIZE)
            .with_inline_threshold(SUITE_INLINE_THRESHOLD)
    }
}

/// Fresh, initialized store.
pub async fn initialized(fixture: &dyn StoreFixture) -> Box<dyn JobStore> {
    let mut store = fixture.fresh().await.unwrap();
    store.initialize(fixture.config()).await.unwrap();
    store
}

/// Second, resumed handle on the same store.
pub async fn resumed(fixture: &dyn StoreFixture, store: &dyn JobStore) -> Box<dyn JobStore> {
    let mut other = fixture.reopen(&store.locator()).await.unwrap();
    other.resume().await.unwrap();
    other
}

/// Write a fresh random key file into the fixture's scratch space.
pub async fn key_file(fixture: &dyn StoreFixture, name: &str) -> PathBuf {
    let key = EncryptionKey::generate();
    let path = fixture.scratch().join(name);
    tokio::fs::write(&path, key.as_bytes()).await.unwrap();
    path
}

//! Runs the shared conformance suite against the directory store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use jobvault_conformance::StoreFixture;
use jobvault_core::{JobStore, Locator, StoreError, StoreResult};
use jobvault_file::FileJobStore;
use tempfile::TempDir;

struct FileFixture {
    dir: TempDir,
    scratch: PathBuf,
    next: AtomicU32,
}

impl FileFixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        Self {
            dir,
            scratch,
            next: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StoreFixture for FileFixture {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fresh(&self) -> StoreResult<Box<dyn JobStore>> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let root = self.dir.path().join(format!("store-{n}"));
        Ok(Box::new(FileJobStore::new(root)?))
    }

    async fn reopen(&self, locator: &str) -> StoreResult<Box<dyn JobStore>> {
        match Locator::parse(locator)? {
            Locator::File(path) => Ok(Box::new(FileJobStore::new(path)?)),
            other => Err(StoreError::InvalidLocator(other.to_string())),
        }
    }

    fn scratch(&self) -> &Path {
        &self.scratch
    }
}

jobvault_conformance::conformance_suite!(FileFixture::new());

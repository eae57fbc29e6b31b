//! Runs the shared conformance suite against the object store on the
//! in-process object service.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use jobvault_conformance::StoreFixture;
use jobvault_core::{JobStore, Locator, StoreError, StoreResult};
use jobvault_object::{MemoryBackend, MemoryObjectService, ObjectJobStore};
use tempfile::TempDir;

const REGION: &str = "local";

struct MemoryFixture {
    service: Arc<MemoryObjectService>,
    scratch: TempDir,
    next: AtomicU32,
}

impl MemoryFixture {
    fn new() -> Self {
        Self {
            service: MemoryObjectService::new(),
            scratch: TempDir::new().unwrap(),
            next: AtomicU32::new(0),
        }
    }

    fn open(&self, region: &str, name: &str) -> StoreResult<Box<dyn JobStore>> {
        let backend = MemoryBackend::new(self.service.clone(), region);
        Ok(Box::new(ObjectJobStore::new(backend, name)?))
    }
}

#[async_trait]
impl StoreFixture for MemoryFixture {
    fn name(&self) -> &'static str {
        "mem"
    }

    async fn fresh(&self) -> StoreResult<Box<dyn JobStore>> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.open(REGION, &format!("suite-{n}"))
    }

    async fn reopen(&self, locator: &str) -> StoreResult<Box<dyn JobStore>> {
        match Locator::parse(locator)? {
            Locator::Object {
                backend,
                region,
                name,
            } if backend == "mem" => self.open(&region, &name),
            other => Err(StoreError::InvalidLocator(other.to_string())),
        }
    }

    fn scratch(&self) -> &Path {
        self.scratch.path()
    }
}

jobvault_conformance::conformance_suite!(MemoryFixture::new());

//! Conformance suite against real S3.
//!
//! Ignored by default. Run with AWS credentials in the environment and
//!
//! ```text
//! JOBVAULT_TEST_S3_REGION=eu-west-1 cargo test -p jobvault-adapter-s3 -- --ignored
//! ```
//!
//! Every test creates and destroys its own pair of buckets.

use std::path::Path;

use async_trait::async_trait;
use jobvault_adapter_s3::{MIN_PART_SIZE, ObjectJobStore, S3Backend};
use jobvault_conformance::{SUITE_INLINE_THRESHOLD, StoreFixture};
use jobvault_core::{JobStore, Locator, StoreConfig, StoreError, StoreResult};
use tempfile::TempDir;

const REGION_VAR: &str = "JOBVAULT_TEST_S3_REGION";

struct S3Fixture {
    scratch: TempDir,
    run: String,
}

impl S3Fixture {
    fn new() -> Self {
        let run = uuid::Uuid::new_v4().simple().to_string();
        Self {
            scratch: TempDir::new().unwrap(),
            run: run[..12].to_string(),
        }
    }

    async fn open(&self, region: &str, name: &str) -> StoreResult<Box<dyn JobStore>> {
        let backend = S3Backend::connect(region).await;
        Ok(Box::new(ObjectJobStore::new(backend, name)?))
    }
}

#[async_trait]
impl StoreFixture for S3Fixture {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn fresh(&self) -> StoreResult<Box<dyn JobStore>> {
        let region = std::env::var(REGION_VAR)
            .map_err(|_| StoreError::Config(format!("{REGION_VAR} is not set")))?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.open(&region, &format!("jv-{}-{}", self.run, &suffix[..8]))
            .await
    }

    async fn reopen(&self, locator: &str) -> StoreResult<Box<dyn JobStore>> {
        match Locator::parse(locator)? {
            Locator::Object {
                backend,
                region,
                name,
            } if backend == "aws" => self.open(&region, &name).await,
            other => Err(StoreError::InvalidLocator(other.to_string())),
        }
    }

    fn scratch(&self) -> &Path {
        self.scratch.path()
    }

    fn config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_part_size(MIN_PART_SIZE)
            .with_inline_threshold(SUITE_INLINE_THRESHOLD)
    }
}

jobvault_conformance::conformance_suite!(
    S3Fixture::new(),
    #[ignore = "needs AWS credentials and JOBVAULT_TEST_S3_REGION"]
);

//! Jobvault: a durable store for the job graph and files of a batch
//! workflow.
//!
//! This crate ties the backends together behind one entry point. A store is
//! named by a locator string:
//!
//! | Locator | Backend |
//! |---------|---------|
//! | `file:/path`, `/path`, `./path` | Directory on a shared filesystem |
//! | `mem:<region>:<name>` | In-process object service (tests, single process) |
//! | `aws:<region>:<name>` | Amazon S3 (feature `s3`, on by default) |
//!
//! [`open`] returns a detached handle; call `initialize` to create the store
//! or `resume` to attach to an existing one.
//!
//! # Example
//!
//! ```ignore
//! use jobvault::{JobNode, JobStore, OpenContext, Requirements, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     jobvault::telemetry::init_default_tracing()?;
//!
//!     let mut store = jobvault::open("file:/scratch/run-42", &OpenContext::default()).await?;
//!     store.initialize(StoreConfig::load(None)?).await?;
//!
//!     let root = store
//!         .create_root_job(JobNode::new("root", Requirements::default()))
//!         .await?;
//!     println!("root job {}", root.id);
//!     Ok(())
//! }
//! ```

mod open;
pub mod telemetry;

pub use open::{OpenContext, open};

// Re-export common types
pub use jobvault_core::{
    FileId, FileOwner, JobBatch, JobDescription, JobId, JobNode, JobRef, JobStore, Locator,
    Requirements, RetryPolicy, StoreConfig, StoreError, StoreResult,
};
pub use jobvault_file::FileJobStore;
pub use jobvault_object::{MemoryObjectService, ObjectJobStore};

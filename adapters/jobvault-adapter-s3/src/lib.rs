//! Jobvault Adapter for Amazon S3
//!
//! This crate provides an [`ObjectBackend`] for Amazon S3 and S3-compatible
//! services. Wrapped in an [`ObjectJobStore`] it is addressed by locators of
//! the form `aws:<region>:<name>` and keeps each store in two buckets,
//! `<name>--jobs` and `<name>--files`.
//!
//! # Mapping
//!
//! | Store concept | S3 feature |
//! |---------------|------------|
//! | Container | Bucket, created with a location constraint |
//! | Version tag | ETag |
//! | Conditional create / replace | `If-None-Match: *` / `If-Match` |
//! | Server-side encryption | SSE-C (`AES256` customer key) |
//! | Streaming upload | Multipart upload |
//! | Public URL | Presigned `GET`, valid for up to seven days |
//! | Native URLs | `s3://<bucket>/<key>` |
//!
//! # Authentication
//!
//! AWS credentials are loaded from the standard AWS credential chain:
//! environment variables, shared config, SSO, or IAM role.
//!
//! # Example
//!
//! ```ignore
//! use jobvault_adapter_s3::S3Backend;
//! use jobvault_core::{JobStore, StoreConfig};
//! use jobvault_object::ObjectJobStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = S3Backend::connect("eu-west-1").await;
//!     let mut store = ObjectJobStore::new(backend, "nightly-run")?;
//!     store.initialize(StoreConfig::default()).await?;
//!     println!("{}", store.locator());
//!     Ok(())
//! }
//! ```

mod backend;
mod error;

pub use backend::{MAX_PRESIGN_EXPIRY, MIN_PART_SIZE, S3_PREFIX, S3Backend};
pub use error::{S3Error, S3Result};

// Re-export common types
pub use jobvault_object::{ObjectBackend, ObjectJobStore};

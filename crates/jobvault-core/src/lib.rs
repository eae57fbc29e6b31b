//! Jobvault core: the job store contract and everything backends share.
//!
//! This crate defines:
//! - the [`JobStore`] trait and its provided two-phase update, batching,
//!   root-job, `clean`, recovery and import/export operations,
//! - the job and file record models,
//! - the streaming engine ([`WriteHandle`], [`ReadHandle`]) with multipart
//!   splitting, SHA-256 checksumming and client-side envelope encryption,
//! - store configuration, locators, URL handlers and retry helpers.
//!
//! Backends live in separate crates (`jobvault-file`, `jobvault-object`).
//!
//! # Example
//!
//! ```ignore
//! use jobvault_core::{JobNode, JobStore, Requirements};
//!
//! async fn run(store: &dyn JobStore) -> jobvault_core::StoreResult<()> {
//!     let mut parent = store.create(JobNode::new("parent", Requirements::default())).await?;
//!     let child = store.create(JobNode::new("child", Requirements::default())).await?;
//!     parent.push_successors([child.to_ref()]);
//!     store.update(&mut parent).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod file;
pub mod job;
pub mod locator;
pub mod multipart;
pub mod retry;
pub mod store;
pub mod stream;
pub mod url;

pub use config::StoreConfig;
pub use crypto::{EncryptionKey, KeyRing};
pub use error::{StoreError, StoreResult};
pub use file::{ContentSummary, FileId, FileOwner, FileRecord, StoredContent};
pub use job::{JobDescription, JobId, JobNode, JobRef, Requirements};
pub use locator::Locator;
pub use retry::{RetryPolicy, retry_transient};
pub use store::{JobBatch, JobStore};
pub use stream::{ContentSink, ContentSource, ReadHandle, UploadSummary, WriteHandle, WriteOptions};
pub use url::{UrlAccess, UrlRegistry};

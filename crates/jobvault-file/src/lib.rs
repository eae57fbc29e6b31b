//! Directory-backed job store.
//!
//! [`FileJobStore`] keeps jobs, files, shared files and stats below a single
//! directory, which may live on a shared filesystem used by many workers.
//! It is the reference backend: every behaviour of the
//! [`JobStore`](jobvault_core::JobStore) contract is realised with plain
//! files, atomic renames and directory removal.
//!
//! # Example
//!
//! ```ignore
//! use jobvault_core::{JobStore, StoreConfig};
//! use jobvault_file::FileJobStore;
//!
//! let mut store = FileJobStore::new("/shared/run-42")?;
//! store.initialize(StoreConfig::default()).await?;
//! ```

mod content;
mod layout;
mod store;

pub use store::FileJobStore;

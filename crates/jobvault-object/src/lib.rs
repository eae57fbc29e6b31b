//! Object-store-backed job store.
//!
//! [`ObjectJobStore`] keeps a job store in two containers of a regional
//! object service. Vendors plug in through the [`ObjectBackend`] seam; this
//! crate ships the in-process [`MemoryBackend`], used for local runs and
//! tests, and the S3 adapter lives in `jobvault-adapter-s3`.
//!
//! # Example
//!
//! ```ignore
//! use jobvault_core::{JobStore, StoreConfig};
//! use jobvault_object::{MemoryBackend, MemoryObjectService, ObjectJobStore};
//!
//! let backend = MemoryBackend::new(MemoryObjectService::global(), "local");
//! let mut store = ObjectJobStore::new(backend, "run-42")?;
//! store.initialize(StoreConfig::default()).await?;
//! ```

pub mod backend;
mod content;
pub mod memory;
pub mod naming;
mod records;
mod store;
mod url;

pub use backend::{ListPage, ObjectBackend, ObjectMeta, Precondition, PutOptions};
pub use memory::{MEMORY_SCHEME, MemoryBackend, MemoryObjectService};
pub use naming::{Containers, validate_store_name};
pub use store::ObjectJobStore;
pub use url::ObjectUrlAccess;

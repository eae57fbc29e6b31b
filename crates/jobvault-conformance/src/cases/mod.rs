//! Conformance cases, grouped by area of the contract.
//!
//! Every case has the signature
//! `async fn(&dyn StoreFixture, &ExternalStores)` and panics on a violation.

pub mod crypto;
pub mod files;
pub mod import;
pub mod jobs;
pub mod lifecycle;
pub mod shared;
pub mod staged;
pub mod stats;
pub mod streams;

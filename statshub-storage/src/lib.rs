//! Append-only record stores for the statshub coordination hub.
//!
//! The hub persists three record families through the same interface:
//! aggregated metric records, free-text log entries, and error reports.
//! This crate defines the `RecordStore` trait plus the bundled backends:
//!
//! - [`JsonlStore`]: one append-only JSON-lines file per family under a
//!   data directory (default for single-node deployments)
//! - [`MemoryStore`]: shared in-memory buffer for tests

pub mod error;
pub mod local;
pub mod memory;
pub mod traits;

pub use error::{Result, StorageError};
pub use local::JsonlStore;
pub use memory::MemoryStore;
pub use traits::{Record, RecordStore};

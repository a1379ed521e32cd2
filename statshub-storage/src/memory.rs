//! In-memory record store.
//!
//! Used by tests and as a stand-in when durability is not required.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::Result;
use crate::traits::{Record, RecordStore};

/// Record store that keeps everything in a shared in-memory vector.
///
/// Clones share the same underlying buffer, so a test can hold one handle
/// while the hub writes through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record appended so far, in write order.
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, record: Record) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

//! Core record store trait definitions.
//!
//! The `RecordStore` trait is the interface the hub uses for every durable
//! write: aggregated metric records, free-text log entries, and error
//! reports. The hub never depends on a concrete backend.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One appended record.
///
/// The id is derived from the wall-clock timestamp at creation time
/// (milliseconds since the Unix epoch), matching the shape of the persisted
/// rows: aggregated records carry a merged-field object as `data`, log and
/// error records carry a plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub data: Value,
}

impl Record {
    /// Create a record with a fresh timestamp-derived identifier.
    pub fn new(data: Value) -> Self {
        Self {
            id: Utc::now().timestamp_millis(),
            data,
        }
    }

    /// Create a record carrying a plain text payload (log/error entries).
    pub fn text(data: impl Into<String>) -> Self {
        Self::new(Value::String(data.into()))
    }
}

/// Append-only record store.
///
/// Implementations must be `Send + Sync`; the hub invokes `create`
/// asynchronously and lets the completion (not the invocation) drive its
/// own state changes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append one record. The store must not reorder or drop acknowledged
    /// writes.
    async fn create(&self, record: Record) -> crate::error::Result<()>;

    /// Connection test used at startup. A failing store aborts hub startup
    /// entirely.
    async fn ping(&self) -> crate::error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_is_timestamp_millis() {
        let before = Utc::now().timestamp_millis();
        let record = Record::new(json!({"count": [1, 2]}));
        let after = Utc::now().timestamp_millis();
        assert!(record.id >= before && record.id <= after);
    }

    #[test]
    fn test_text_record_wraps_string() {
        let record = Record::text("worker 3 restarted");
        assert_eq!(record.data, Value::String("worker 3 restarted".into()));
    }
}

//! Local filesystem record store.
//!
//! The default backend for single-node deployments: each logical store is
//! one append-only JSON-lines file under the configured data directory.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::traits::{Record, RecordStore};

/// Record store appending to `<data_dir>/<name>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    data_dir: PathBuf,
    name: String,
}

impl JsonlStore {
    /// Create a store for the named record family. The data directory is
    /// created lazily on first write or ping.
    pub fn new(data_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            name: name.into(),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.jsonl", self.name))
    }

    /// Read back every record in append order. Used by operator tooling and
    /// tests; the hub itself only ever appends.
    pub async fn read_all(&self) -> Result<Vec<Record>> {
        let raw = match fs::read_to_string(self.path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl RecordStore for JsonlStore {
    async fn create(&self, record: Record) -> Result<()> {
        fs::create_dir_all(&self.data_dir).await?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(store = %self.name, id = record.id, "appended record");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", self.data_dir.display(), e)))
    }
}

//! Cluster registry: the set of authenticated connections.
//!
//! The registry owns every `ClusterConnection`, the declared fleet size,
//! and membership broadcast. The fleet size is fixed by the first cluster
//! to complete a handshake into an empty registry and never changes for
//! the life of the process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::heartbeat::HeartbeatTimer;
use crate::protocol::{self, CloseCode, Outbound};

/// One authenticated fleet member.
///
/// Created on successful handshake, destroyed on close/error/eviction.
/// The heartbeat timer and its epoch are mutated only by the heartbeat
/// path; the epoch lets an already-fired-but-aborted timer detect that it
/// lost the race against a re-arm.
#[derive(Debug)]
pub struct ClusterConnection {
    pub index: u16,
    pub user: String,
    pub last_heartbeat: DateTime<Utc>,
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub timer: Option<HeartbeatTimer>,
    pub timer_epoch: u64,
}

impl ClusterConnection {
    pub fn new(index: u16, user: String, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            index,
            user,
            last_heartbeat: Utc::now(),
            tx,
            timer: None,
            timer_epoch: 0,
        }
    }

    /// Queue a text frame. Best effort: a closed writer means the
    /// connection is already going away and eviction will follow from the
    /// read task.
    pub fn send(&self, frame: String) {
        if self.tx.send(Outbound::Frame(frame)).is_err() {
            trace!(index = self.index, "dropped frame for closing connection");
        }
    }

    /// Queue a close frame with a specific code.
    pub fn close(&self, code: CloseCode) {
        let _ = self.tx.send(Outbound::Close(code));
    }
}

/// Registry snapshot entry exposed through the service facade.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    pub index: u16,
    pub user: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Process-wide set of authenticated connections keyed by cluster index.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    fleet_size: Option<u16>,
    members: HashMap<u16, ClusterConnection>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared fleet size, if any cluster has completed a handshake yet.
    pub fn fleet_size(&self) -> Option<u16> {
        self.fleet_size
    }

    /// Adopt the fleet size declared by the first member.
    pub fn adopt_fleet_size(&mut self, size: u16) {
        self.fleet_size = Some(size);
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, index: u16) -> bool {
        self.members.contains_key(&index)
    }

    pub fn get(&self, index: u16) -> Option<&ClusterConnection> {
        self.members.get(&index)
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut ClusterConnection> {
        self.members.get_mut(&index)
    }

    /// Register a connection under its index. The handshake guarantees the
    /// slot is free and in range before calling this.
    pub fn insert(&mut self, conn: ClusterConnection) {
        debug_assert!(!self.members.contains_key(&conn.index));
        self.members.insert(conn.index, conn);
    }

    pub fn remove(&mut self, index: u16) -> Option<ClusterConnection> {
        self.members.remove(&index)
    }

    /// Currently connected indices, ascendingly ordered.
    pub fn connected_indices(&self) -> Vec<u16> {
        let mut indices: Vec<u16> = self.members.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Queue a frame to every current member.
    pub fn broadcast(&self, frame: &str) {
        for conn in self.members.values() {
            conn.send(frame.to_string());
        }
    }

    /// Membership snapshot frame `{clusters, connected}`. `None` while the
    /// fleet size is still unset (empty registry, nothing to tell anyone).
    pub fn status_frame(&self) -> Option<String> {
        let fleet_size = self.fleet_size?;
        Some(protocol::cluster_status(fleet_size, &self.connected_indices()))
    }

    /// Broadcast a fresh membership snapshot to every current member.
    pub fn broadcast_status(&self) {
        if let Some(frame) = self.status_frame() {
            self.broadcast(&frame);
        }
    }

    /// Snapshot of the live membership for the facade, ordered by index.
    pub fn snapshot(&self) -> Vec<ClusterInfo> {
        let mut all: Vec<ClusterInfo> = self
            .members
            .values()
            .map(|c| ClusterInfo {
                index: c.index,
                user: c.user.clone(),
                last_heartbeat: c.last_heartbeat,
            })
            .collect();
        all.sort_by_key(|c| c.index);
        all
    }
}

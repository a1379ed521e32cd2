//! Service facade event stream.
//!
//! The owning process subscribes to exactly three occurrence kinds over a
//! broadcast channel (no dynamic event names): a cluster completed its
//! handshake, a cluster was evicted, or a cluster's data submission was
//! accepted. Commands flow the other way as plain methods on [`Hub`].
//!
//! [`Hub`]: crate::hub::Hub

use serde_json::Value;

use crate::protocol::{CloseCode, DataKind};

/// One facade occurrence.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A cluster completed the handshake and joined the fleet.
    Authenticated {
        index: u16,
        fleet_size: u16,
        user: String,
    },
    /// A cluster was evicted; `code` is the close code the transport was
    /// closed with.
    Disconnected { index: u16, code: CloseCode },
    /// A data submission was accepted (and, for log/error entries,
    /// durably stored).
    Data {
        index: u16,
        kind: DataKind,
        data: Value,
    },
}

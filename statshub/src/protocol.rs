//! Wire protocol: envelope codec, opcodes, close codes, payload shapes.
//!
//! Every frame on the wire is a JSON envelope `{op, d}`. The opcode space
//! is partitioned by direction: server-originated and client-originated
//! codes are distinct enumerations that happen to share the wire field.
//! Decoding validates that the envelope is an object with a numeric `op`
//! before anything else looks at it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Opcodes the hub sends to clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOpCode {
    Heartbeat = 0,
    Identify = 1,
    DataAck = 2,
    CccPropagate = 3,
    CccReturn = 4,
    CccConfirm = 5,
    ClusterStatus = 6,
    DataPushed = 7,
}

/// Opcodes clusters send to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOpCode {
    Heartbeat = 0,
    Identity = 1,
    SendData = 2,
    CccBegin = 3,
    CccReturn = 4,
}

impl ClientOpCode {
    pub fn from_wire(op: u64) -> Option<Self> {
        match op {
            0 => Some(ClientOpCode::Heartbeat),
            1 => Some(ClientOpCode::Identity),
            2 => Some(ClientOpCode::SendData),
            3 => Some(ClientOpCode::CccBegin),
            4 => Some(ClientOpCode::CccReturn),
            _ => None,
        }
    }
}

/// Close codes sent on transport close.
///
/// Two families: standard transport codes and protocol codes in the
/// private 4000 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    Abnormal = 1006,
    ServerError = 1011,
    ServiceRestart = 1012,
    TryAgainLater = 1013,
    BadGateway = 1014,
    UnknownError = 4000,
    InvalidOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    HeartbeatTimeout = 4006,
    RateLimited = 4007,
    InvalidCluster = 4008,
    InvalidClusterCount = 4009,
    InvalidRelayId = 4010,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the code as a string for logs and metrics labeling.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseCode::Normal => "normal",
            CloseCode::Abnormal => "abnormal",
            CloseCode::ServerError => "server_error",
            CloseCode::ServiceRestart => "service_restart",
            CloseCode::TryAgainLater => "try_again_later",
            CloseCode::BadGateway => "bad_gateway",
            CloseCode::UnknownError => "unknown_error",
            CloseCode::InvalidOpcode => "invalid_opcode",
            CloseCode::DecodeError => "decode_error",
            CloseCode::NotAuthenticated => "not_authenticated",
            CloseCode::AuthenticationFailed => "authentication_failed",
            CloseCode::AlreadyAuthenticated => "already_authenticated",
            CloseCode::HeartbeatTimeout => "heartbeat_timeout",
            CloseCode::RateLimited => "rate_limited",
            CloseCode::InvalidCluster => "invalid_cluster",
            CloseCode::InvalidClusterCount => "invalid_cluster_count",
            CloseCode::InvalidRelayId => "invalid_relay_id",
        }
    }
}

/// Generic abstract close reasons used at the service boundary.
///
/// The owning process and the data-ack path speak in these; the
/// translator below maps them onto concrete wire close codes. DataAck
/// failure payloads carry the generic code, not the translated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenericClose {
    ServerRestarting = 0,
    InvalidData = 1,
    ServerError = 2,
    NotReadyForData = 3,
}

impl GenericClose {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Translate the abstract reason to the protocol's numeric close code.
    pub fn close_code(self) -> CloseCode {
        match self {
            GenericClose::ServerRestarting => CloseCode::ServiceRestart,
            GenericClose::InvalidData => CloseCode::DecodeError,
            GenericClose::ServerError => CloseCode::ServerError,
            GenericClose::NotReadyForData => CloseCode::TryAgainLater,
        }
    }
}

/// Identity payload, the first (and only) pre-auth client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub token: String,
    /// Declared fleet size.
    pub clusters: u16,
    /// Declared slot for this connection.
    pub cluster: u16,
}

/// SendData subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Metric shard: schema-validated, goes through the aggregation barrier.
    Metrics,
    /// Free-text log entry: append-only store, no coordination.
    Log,
    /// Error report: append-only store, no coordination.
    Error,
}

impl DataKind {
    pub fn from_wire(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(DataKind::Metrics),
            1 => Some(DataKind::Log),
            2 => Some(DataKind::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Metrics => "metrics",
            DataKind::Log => "log",
            DataKind::Error => "error",
        }
    }
}

/// SendData payload `{type, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDataPayload {
    #[serde(rename = "type")]
    pub kind: u8,
    pub data: Value,
}

/// Relay addressing: one slot or the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTarget {
    All,
    Index(u16),
}

impl Serialize for RelayTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RelayTarget::All => serializer.serialize_str("all"),
            RelayTarget::Index(index) => serializer.serialize_u16(*index),
        }
    }
}

impl<'de> Deserialize<'de> for RelayTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(s) if s == "all" => Ok(RelayTarget::All),
            Value::Number(n) => n
                .as_u64()
                .filter(|n| *n <= u64::from(u16::MAX))
                .map(|n| RelayTarget::Index(n as u16))
                .ok_or_else(|| serde::de::Error::custom("relay target out of range")),
            _ => Err(serde::de::Error::custom("relay target must be an index or \"all\"")),
        }
    }
}

/// CCCBegin payload `{to, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CccBeginPayload {
    pub to: RelayTarget,
    pub data: String,
}

/// CCCReturn payload `{id, data}` (client → hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CccReturnPayload {
    pub id: String,
    pub data: String,
}

/// Decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub op: ClientOpCode,
    pub d: Option<Value>,
}

impl Envelope {
    /// Decode a raw text frame.
    ///
    /// Returns the close code the connection must be terminated with on
    /// failure: `DecodeError` for frames that are not a JSON object,
    /// `InvalidOpcode` for a missing, non-numeric, or unknown opcode.
    pub fn decode(raw: &str) -> Result<Self, CloseCode> {
        let value: Value = serde_json::from_str(raw).map_err(|_| CloseCode::DecodeError)?;
        let obj = value.as_object().ok_or(CloseCode::DecodeError)?;
        let op = obj
            .get("op")
            .and_then(Value::as_u64)
            .ok_or(CloseCode::InvalidOpcode)?;
        let op = ClientOpCode::from_wire(op).ok_or(CloseCode::InvalidOpcode)?;
        Ok(Self {
            op,
            d: obj.get("d").cloned(),
        })
    }

    /// Decode the `d` field into a typed payload. A missing or malformed
    /// payload yields the given close code.
    pub fn payload<T: DeserializeOwned>(&self, on_invalid: CloseCode) -> Result<T, CloseCode> {
        let d = self.d.clone().ok_or(on_invalid)?;
        serde_json::from_value(d).map_err(|_| on_invalid)
    }
}

/// Build an outbound server frame.
pub fn server_frame(op: ServerOpCode, d: Value) -> String {
    json!({"op": op as u8, "d": d}).to_string()
}

/// Build an outbound server frame with no payload.
pub fn server_frame_empty(op: ServerOpCode) -> String {
    json!({"op": op as u8}).to_string()
}

/// Heartbeat acknowledgment.
pub fn heartbeat_ack() -> String {
    server_frame_empty(ServerOpCode::Heartbeat)
}

/// Identify frame sent immediately on connect: heartbeat interval plus the
/// active schema document.
pub fn identify(heartbeat_interval_ms: u64, schema: &Value) -> String {
    server_frame(
        ServerOpCode::Identify,
        json!({"heartbeat_interval_ms": heartbeat_interval_ms, "schema": schema}),
    )
}

/// Positive data acknowledgment.
pub fn data_ack_ok() -> String {
    server_frame(ServerOpCode::DataAck, json!({"ok": true}))
}

/// Negative data acknowledgment carrying the generic reason code.
pub fn data_ack_failure(code: GenericClose) -> String {
    server_frame(ServerOpCode::DataAck, json!({"ok": false, "code": code.as_u8()}))
}

/// Membership snapshot broadcast after every registry mutation.
pub fn cluster_status(fleet_size: u16, connected: &[u16]) -> String {
    server_frame(
        ServerOpCode::ClusterStatus,
        json!({"clusters": fleet_size, "connected": connected}),
    )
}

/// Notification that a fresh aggregated record was pushed to storage.
pub fn data_pushed() -> String {
    server_frame_empty(ServerOpCode::DataPushed)
}

/// Relay propagation to an addressed cluster.
pub fn ccc_propagate(id: &str, data: &str) -> String {
    server_frame(ServerOpCode::CccPropagate, json!({"id": id, "data": data}))
}

/// Relay-instance confirmation back to the initiator.
pub fn ccc_confirm(id: &str) -> String {
    server_frame(ServerOpCode::CccConfirm, json!({"id": id}))
}

/// Final relay result forwarded to the initiator. `data` is a scalar
/// string for single-target instances, an index-ordered array for
/// broadcast instances.
pub fn ccc_return(id: &str, data: Value) -> String {
    server_frame(ServerOpCode::CccReturn, json!({"id": id, "data": data}))
}

/// Commands queued to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Send a text frame.
    Frame(String),
    /// Send a close frame with the given code, then terminate the writer.
    Close(CloseCode),
}

//! The hub coordinator.
//!
//! One `Hub` is constructed at startup and owns every piece of shared
//! coordination state: the cluster registry, the pending aggregation
//! round, and the relay-instance table, all behind a single mutex so
//! every mutation is serialized (single-writer discipline). Inbound
//! frames are dispatched by opcode; storage collaborators are invoked
//! asynchronously and their completion — not their invocation — drives
//! the follow-on state changes.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use statshub_storage::{Record, RecordStore};

use crate::aggregate::AggregationBarrier;
use crate::auth::Authenticator;
use crate::config::HubConfig;
use crate::handshake;
use crate::heartbeat::HeartbeatTimer;
use crate::metrics;
use crate::protocol::{
    self, ClientOpCode, CloseCode, CccBeginPayload, CccReturnPayload, DataKind, Envelope,
    GenericClose, Outbound, RelayTarget, SendDataPayload,
};
use crate::registry::{ClusterConnection, ClusterInfo, ClusterRegistry};
use crate::relay::{RelayTable, ResponseSet, ReturnOutcome};
use crate::schema;
use crate::service::ServiceEvent;

/// The three storage collaborators the hub writes through.
#[derive(Clone)]
pub struct HubStores {
    pub aggregates: Arc<dyn RecordStore>,
    pub logs: Arc<dyn RecordStore>,
    pub errors: Arc<dyn RecordStore>,
}

struct HubState {
    registry: ClusterRegistry,
    pending: AggregationBarrier,
    relays: RelayTable,
}

/// Coordination hub for one fixed-size fleet.
pub struct Hub {
    config: HubConfig,
    schema: Value,
    auth: Arc<dyn Authenticator>,
    stores: HubStores,
    state: Mutex<HubState>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        schema: Value,
        auth: Arc<dyn Authenticator>,
        stores: HubStores,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            schema,
            auth,
            stores,
            state: Mutex::new(HubState {
                registry: ClusterRegistry::new(),
                pending: AggregationBarrier::new(),
                relays: RelayTable::new(),
            }),
            events,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Subscribe to the facade event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ServiceEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Identify frame sent to every connection the moment it arrives.
    pub fn identify_frame(&self) -> String {
        protocol::identify(self.config.heartbeat_interval_ms, &self.schema)
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Drive the one permitted pre-auth message. On success the
    /// connection is registered, its heartbeat armed, and the new
    /// membership broadcast; the returned index keys all further
    /// dispatch. On failure the caller must close with the returned code.
    pub fn handle_identity(
        self: &Arc<Self>,
        tx: &mpsc::UnboundedSender<Outbound>,
        raw: &str,
    ) -> Result<u16, CloseCode> {
        // A first message that does not decode is treated the same as a
        // first message without an identity payload.
        let envelope = Envelope::decode(raw).map_err(|_| CloseCode::InvalidOpcode)?;

        let mut state = self.state.lock();
        let admission = handshake::admit(&state.registry, self.auth.as_ref(), &envelope)
            .inspect_err(|code| metrics::record_handshake_rejected(code.as_str()))?;

        if state.registry.is_empty() {
            state.registry.adopt_fleet_size(admission.fleet_size);
        }
        state.registry.insert(ClusterConnection::new(
            admission.index,
            admission.user.clone(),
            tx.clone(),
        ));
        self.arm_heartbeat_locked(&mut state, admission.index);
        state.registry.broadcast_status();

        metrics::record_handshake(&admission.user);
        metrics::update_member_count(state.registry.len());
        drop(state);

        info!(
            index = admission.index,
            fleet_size = admission.fleet_size,
            user = %admission.user,
            "cluster authenticated"
        );
        self.emit(ServiceEvent::Authenticated {
            index: admission.index,
            fleet_size: admission.fleet_size,
            user: admission.user,
        });
        Ok(admission.index)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch one post-handshake frame from the given member.
    pub async fn handle_frame(self: &Arc<Self>, index: u16, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(code) => {
                self.evict(index, code);
                return;
            }
        };

        match envelope.op {
            ClientOpCode::Heartbeat => self.on_heartbeat(index),
            // Re-identification is a protocol violation.
            ClientOpCode::Identity => self.evict(index, CloseCode::AlreadyAuthenticated),
            ClientOpCode::SendData => self.on_send_data(index, &envelope).await,
            ClientOpCode::CccBegin => self.on_ccc_begin(index, &envelope),
            ClientOpCode::CccReturn => self.on_ccc_return(index, &envelope),
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    fn on_heartbeat(self: &Arc<Self>, index: u16) {
        let mut state = self.state.lock();
        if !state.registry.contains(index) {
            return;
        }
        // Cancel-and-re-arm happens under the state lock, so the old
        // timer can never fire against the refreshed connection.
        self.arm_heartbeat_locked(&mut state, index);
        if let Some(conn) = state.registry.get_mut(index) {
            conn.last_heartbeat = Utc::now();
            conn.send(protocol::heartbeat_ack());
        }
    }

    fn arm_heartbeat_locked(self: &Arc<Self>, state: &mut HubState, index: u16) {
        let timeout = self.config.heartbeat_timeout();
        let Some(conn) = state.registry.get_mut(index) else {
            return;
        };
        conn.timer_epoch += 1;
        let epoch = conn.timer_epoch;
        let hub = Arc::clone(self);
        // Replacing the handle aborts the previous timer.
        conn.timer = Some(HeartbeatTimer::arm(timeout, async move {
            hub.heartbeat_expired(index, epoch);
        }));
    }

    fn heartbeat_expired(&self, index: u16, epoch: u64) {
        let mut state = self.state.lock();
        // An aborted-but-already-fired timer loses the race here.
        if state.registry.get(index).map(|c| c.timer_epoch) != Some(epoch) {
            return;
        }
        warn!(index, "heartbeat timeout");
        self.evict_locked(&mut state, index, CloseCode::HeartbeatTimeout);
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Remove a member: close its transport with `code`, cancel its
    /// heartbeat timer, settle its relay involvement, rebroadcast
    /// membership, and emit `Disconnected`. Idempotent.
    pub fn evict(&self, index: u16, code: CloseCode) {
        let mut state = self.state.lock();
        self.evict_locked(&mut state, index, code);
    }

    fn evict_locked(&self, state: &mut HubState, index: u16, code: CloseCode) {
        let Some(conn) = state.registry.remove(index) else {
            return;
        };
        if let Some(timer) = &conn.timer {
            timer.cancel();
        }
        conn.close(code);
        drop(conn);

        // A departed member's pending shard would otherwise block its slot
        // for a reconnect, or outlive the fleet generation entirely.
        state.pending.remove(index);

        // Broadcast relay instances may complete now that this member's
        // slot is settled as absent.
        for (initiator, id, set) in state.relays.member_departed(index) {
            metrics::record_relay_resolved("all");
            if let Some(member) = state.registry.get(initiator) {
                member.send(protocol::ccc_return(&id, set.into_value()));
            }
        }

        state.registry.broadcast_status();
        metrics::record_eviction(code.as_str());
        metrics::update_member_count(state.registry.len());
        metrics::update_relay_instances(state.relays.len());

        info!(index, code = code.as_str(), "cluster evicted");
        self.emit(ServiceEvent::Disconnected { index, code });
    }

    // ------------------------------------------------------------------
    // Data submission
    // ------------------------------------------------------------------

    async fn on_send_data(self: &Arc<Self>, index: u16, envelope: &Envelope) {
        let payload: SendDataPayload = match envelope.payload(CloseCode::DecodeError) {
            Ok(payload) => payload,
            Err(code) => {
                self.evict(index, code);
                return;
            }
        };
        let Some(kind) = DataKind::from_wire(payload.kind) else {
            self.reply(index, protocol::data_ack_failure(GenericClose::InvalidData));
            return;
        };

        match kind {
            DataKind::Metrics => self.on_metric_shard(index, payload.data).await,
            DataKind::Log | DataKind::Error => {
                self.on_text_record(index, kind, payload.data).await
            }
        }
    }

    /// Barrier path: one schema-valid shard per cluster per round; the
    /// Nth distinct shard triggers the merge-and-flush.
    async fn on_metric_shard(self: &Arc<Self>, index: u16, shard: Value) {
        let flush = {
            let mut state = self.state.lock();
            let Some(fleet_size) = state.registry.fleet_size() else {
                return;
            };

            if state.pending.contains(index) {
                metrics::record_shard_rejected("duplicate");
                if let Some(conn) = state.registry.get(index) {
                    conn.send(protocol::data_ack_failure(GenericClose::NotReadyForData));
                }
                return;
            }
            if !schema::validate_shard(&self.schema, &shard) {
                metrics::record_shard_rejected("schema");
                if let Some(conn) = state.registry.get(index) {
                    conn.send(protocol::data_ack_failure(GenericClose::NotReadyForData));
                }
                return;
            }

            state.pending.insert(index, shard.clone());
            metrics::record_shard_accepted();
            if let Some(conn) = state.registry.get(index) {
                conn.send(protocol::data_ack_ok());
            }

            if state.pending.is_complete(fleet_size) {
                Some(state.pending.merge())
            } else {
                None
            }
        };

        self.emit(ServiceEvent::Data {
            index,
            kind: DataKind::Metrics,
            data: shard,
        });

        let Some(merged) = flush else { return };
        match self.stores.aggregates.create(Record::new(merged)).await {
            Ok(()) => {
                metrics::record_store_write("aggregates", "ok");
                metrics::record_aggregation_flush("ok");
                let mut state = self.state.lock();
                state.pending.clear();
                state.registry.broadcast(&protocol::data_pushed());
                debug!("aggregation round flushed");
            }
            Err(e) => {
                // No active sender to attribute this to; the owning
                // process sees it through the log stream. The round is
                // cleared so the next one starts clean.
                error!(error = %e, "aggregated record write failed");
                metrics::record_store_write("aggregates", "error");
                metrics::record_aggregation_flush("error");
                self.state.lock().pending.clear();
            }
        }
    }

    /// Log/error entries bypass the barrier: format check, store write,
    /// ack on the write result.
    async fn on_text_record(self: &Arc<Self>, index: u16, kind: DataKind, data: Value) {
        let Some(text) = data.as_str() else {
            self.reply(index, protocol::data_ack_failure(GenericClose::InvalidData));
            return;
        };
        let store = match kind {
            DataKind::Log => &self.stores.logs,
            _ => &self.stores.errors,
        };

        match store.create(Record::text(text)).await {
            Ok(()) => {
                metrics::record_store_write(kind.as_str(), "ok");
                self.reply(index, protocol::data_ack_ok());
                self.emit(ServiceEvent::Data { index, kind, data });
            }
            Err(e) => {
                warn!(index, kind = kind.as_str(), error = %e, "record store write failed");
                metrics::record_store_write(kind.as_str(), "error");
                self.reply(index, protocol::data_ack_failure(GenericClose::ServerError));
            }
        }
    }

    fn reply(&self, index: u16, frame: String) {
        let state = self.state.lock();
        if let Some(conn) = state.registry.get(index) {
            conn.send(frame);
        }
    }

    // ------------------------------------------------------------------
    // CCC relay
    // ------------------------------------------------------------------

    fn on_ccc_begin(self: &Arc<Self>, index: u16, envelope: &Envelope) {
        let payload: CccBeginPayload = match envelope.payload(CloseCode::DecodeError) {
            Ok(payload) => payload,
            Err(code) => {
                self.evict(index, code);
                return;
            }
        };

        let mut state = self.state.lock();
        let Some(fleet_size) = state.registry.fleet_size() else {
            return;
        };

        let addressed: Vec<u16> = match payload.to {
            RelayTarget::Index(target) => {
                if target >= fleet_size || !state.registry.contains(target) {
                    self.evict_locked(&mut state, index, CloseCode::InvalidCluster);
                    return;
                }
                vec![target]
            }
            RelayTarget::All => state.registry.connected_indices(),
        };

        let (id, request) = {
            let instance = state.relays.begin(
                index,
                payload.to,
                payload.data,
                fleet_size,
                addressed.clone(),
            );
            (instance.id.clone(), instance.payload.clone())
        };

        for target in &addressed {
            if let Some(conn) = state.registry.get(*target) {
                conn.send(protocol::ccc_propagate(&id, &request));
            }
        }
        if let Some(conn) = state.registry.get(index) {
            conn.send(protocol::ccc_confirm(&id));
        }
        metrics::update_relay_instances(state.relays.len());
        debug!(initiator = index, id = %id, targets = addressed.len(), "relay instance created");
    }

    fn on_ccc_return(self: &Arc<Self>, index: u16, envelope: &Envelope) {
        let payload: CccReturnPayload = match envelope.payload(CloseCode::DecodeError) {
            Ok(payload) => payload,
            Err(code) => {
                self.evict(index, code);
                return;
            }
        };

        let mut state = self.state.lock();
        match state.relays.handle_return(&payload.id, index, payload.data) {
            ReturnOutcome::UnknownId => {
                // Never existed, or already resolved. Either way: no-op.
                debug!(index, id = %payload.id, "relay return for unknown instance");
            }
            ReturnOutcome::NotAddressed => {
                self.evict_locked(&mut state, index, CloseCode::InvalidRelayId);
            }
            ReturnOutcome::Pending => {}
            ReturnOutcome::Complete(initiator, set) => {
                metrics::record_relay_resolved(match set {
                    ResponseSet::Single(_) => "single",
                    ResponseSet::Broadcast(_) => "all",
                });
                if let Some(conn) = state.registry.get(initiator) {
                    conn.send(protocol::ccc_return(&payload.id, set.into_value()));
                }
                metrics::update_relay_instances(state.relays.len());
            }
        }
    }

    // ------------------------------------------------------------------
    // Service facade commands
    // ------------------------------------------------------------------

    /// Fleet size, once fixed by the first handshake.
    pub fn fleet_size(&self) -> Option<u16> {
        self.state.lock().registry.fleet_size()
    }

    pub fn get_cluster(&self, index: u16) -> Option<ClusterInfo> {
        let state = self.state.lock();
        state.registry.get(index).map(|c| ClusterInfo {
            index: c.index,
            user: c.user.clone(),
            last_heartbeat: c.last_heartbeat,
        })
    }

    pub fn get_all_clusters(&self) -> Vec<ClusterInfo> {
        self.state.lock().registry.snapshot()
    }

    /// Force-disconnect a member with an abstract reason.
    pub fn disconnect_cluster(&self, index: u16, reason: GenericClose) {
        self.evict(index, reason.close_code());
    }

    /// Orderly shutdown: evict every member with the service-restart
    /// code. Must run before process exit.
    pub fn server_closing(&self) {
        let mut state = self.state.lock();
        for index in state.registry.connected_indices() {
            self.evict_locked(&mut state, index, CloseCode::ServiceRestart);
        }
    }

    /// Notify every member that new aggregated data is available.
    pub fn data_pushed(&self) {
        self.state.lock().registry.broadcast(&protocol::data_pushed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;
    use async_trait::async_trait;
    use serde_json::json;
    use statshub_storage::{MemoryStore, StorageError};
    use std::collections::HashMap;
    use std::time::Duration;

    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn create(&self, _record: Record) -> statshub_storage::Result<()> {
            Err(StorageError::Backend("disk full".to_string()))
        }

        async fn ping(&self) -> statshub_storage::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        auth: StaticAuthenticator,
        aggregates: MemoryStore,
        logs: MemoryStore,
    }

    fn fixture() -> Fixture {
        fixture_with(HubConfig::default(), None)
    }

    fn fixture_with(config: HubConfig, errors: Option<Arc<dyn RecordStore>>) -> Fixture {
        let mut users = HashMap::new();
        users.insert("grafana".to_string(), "s3cret".to_string());
        let auth = StaticAuthenticator::new(users);

        let aggregates = MemoryStore::new();
        let logs = MemoryStore::new();
        let stores = HubStores {
            aggregates: Arc::new(aggregates.clone()),
            logs: Arc::new(logs.clone()),
            errors: errors.unwrap_or_else(|| Arc::new(MemoryStore::new())),
        };
        let schema = json!({"count": "number", "name": "string"});

        Fixture {
            hub: Arc::new(Hub::new(config, schema, Arc::new(auth.clone()), stores)),
            auth,
            aggregates,
            logs,
        }
    }

    fn identity_frame(fx: &Fixture, clusters: u16, cluster: u16) -> String {
        let token = fx.auth.generate_token("grafana").unwrap();
        json!({"op": 1, "d": {"token": token, "clusters": clusters, "cluster": cluster}})
            .to_string()
    }

    fn connect(
        fx: &Fixture,
        clusters: u16,
        cluster: u16,
    ) -> (u16, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = fx
            .hub
            .handle_identity(&tx, &identity_frame(fx, clusters, cluster))
            .unwrap();
        (index, rx)
    }

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Frame(frame) = out {
                frames.push(serde_json::from_str(&frame).unwrap());
            }
        }
        frames
    }

    fn drain_close(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<CloseCode> {
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Close(code) = out {
                return Some(code);
            }
        }
        None
    }

    #[tokio::test]
    async fn test_membership_broadcast_lists_joined_indices() {
        let fx = fixture();
        let (_, mut rx0) = connect(&fx, 3, 0);
        let (_, mut rx1) = connect(&fx, 3, 1);

        let frames = drain_frames(&mut rx0);
        let statuses: Vec<&Value> = frames.iter().filter(|f| f["op"] == 6).collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0]["d"]["connected"], json!([0]));
        assert_eq!(statuses[1]["d"]["connected"], json!([0, 1]));
        assert_eq!(statuses[1]["d"]["clusters"], 3);

        let frames = drain_frames(&mut rx1);
        let statuses: Vec<&Value> = frames.iter().filter(|f| f["op"] == 6).collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["d"]["connected"], json!([0, 1]));
    }

    #[tokio::test]
    async fn test_fleet_size_disagreement_never_registers() {
        let fx = fixture();
        let (_, _rx0) = connect(&fx, 3, 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = fx
            .hub
            .handle_identity(&tx, &identity_frame(&fx, 4, 1))
            .unwrap_err();
        assert_eq!(err, CloseCode::InvalidClusterCount);
        assert_eq!(fx.hub.get_all_clusters().len(), 1);
    }

    #[tokio::test]
    async fn test_reidentification_is_fatal() {
        let fx = fixture();
        let (index, mut rx) = connect(&fx, 2, 0);

        fx.hub
            .handle_frame(index, &identity_frame(&fx, 2, 0))
            .await;
        assert_eq!(drain_close(&mut rx), Some(CloseCode::AlreadyAuthenticated));
        assert!(fx.hub.get_cluster(index).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_shard_rejected_first_retained() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 2, 0);
        let (i1, _rx1) = connect(&fx, 2, 1);

        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 0, "data": {"count": 1}}}).to_string())
            .await;
        drain_frames(&mut rx0);

        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 0, "data": {"count": 99}}}).to_string())
            .await;
        let frames = drain_frames(&mut rx0);
        let ack = frames.iter().find(|f| f["op"] == 2).unwrap();
        assert_eq!(ack["d"]["ok"], false);
        assert_eq!(ack["d"]["code"], GenericClose::NotReadyForData.as_u8());
        // Still a member: transient violations never evict.
        assert!(fx.hub.get_cluster(i0).is_some());

        fx.hub
            .handle_frame(i1, &json!({"op": 2, "d": {"type": 0, "data": {"count": 2}}}).to_string())
            .await;

        let records = fx.aggregates.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!({"count": [1, 2]}));
    }

    #[tokio::test]
    async fn test_full_round_flushes_once_and_resets() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 2, 0);
        let (i1, mut rx1) = connect(&fx, 2, 1);

        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 0, "data": {"count": 1}}}).to_string())
            .await;
        fx.hub
            .handle_frame(i1, &json!({"op": 2, "d": {"type": 0, "data": {"count": 2}}}).to_string())
            .await;

        let records = fx.aggregates.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!({"count": [1, 2]}));

        // Exactly one DataPushed per member.
        for rx in [&mut rx0, &mut rx1] {
            let frames = drain_frames(rx);
            assert_eq!(frames.iter().filter(|f| f["op"] == 7).count(), 1);
        }

        // Next round starts clean.
        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 0, "data": {"count": 3}}}).to_string())
            .await;
        let frames = drain_frames(&mut rx0);
        let ack = frames.iter().find(|f| f["op"] == 2).unwrap();
        assert_eq!(ack["d"]["ok"], true);
    }

    #[tokio::test]
    async fn test_schema_invalid_shard_not_ready() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 2, 0);

        fx.hub
            .handle_frame(
                i0,
                &json!({"op": 2, "d": {"type": 0, "data": {"count": "many"}}}).to_string(),
            )
            .await;
        let frames = drain_frames(&mut rx0);
        let ack = frames.iter().find(|f| f["op"] == 2).unwrap();
        assert_eq!(ack["d"]["ok"], false);
        assert_eq!(ack["d"]["code"], GenericClose::NotReadyForData.as_u8());
        assert!(fx.hub.get_cluster(i0).is_some());
        assert!(fx.aggregates.is_empty());
    }

    #[tokio::test]
    async fn test_departed_member_shard_freed_for_reconnect() {
        let fx = fixture();
        let (i0, _rx0) = connect(&fx, 2, 0);
        let (_, _rx1) = connect(&fx, 2, 1);

        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 0, "data": {"count": 1}}}).to_string())
            .await;
        fx.hub.evict(i0, CloseCode::Abnormal);

        // The slot's shard left with the member; the reconnect starts clean.
        let (i0, mut rx0) = connect(&fx, 2, 0);
        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 0, "data": {"count": 5}}}).to_string())
            .await;
        let frames = drain_frames(&mut rx0);
        let ack = frames.iter().find(|f| f["op"] == 2).unwrap();
        assert_eq!(ack["d"]["ok"], true);

        // One slot filled out of two: no flush yet.
        assert!(fx.aggregates.is_empty());
    }

    #[tokio::test]
    async fn test_log_entry_written_and_acked() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 1, 0);
        drain_frames(&mut rx0);

        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 1, "data": "worker idle"}}).to_string())
            .await;

        let records = fx.logs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!("worker idle"));

        let frames = drain_frames(&mut rx0);
        assert_eq!(frames[0]["op"], 2);
        assert_eq!(frames[0]["d"]["ok"], true);
    }

    #[tokio::test]
    async fn test_error_store_failure_is_server_error_not_eviction() {
        let fx = fixture_with(HubConfig::default(), Some(Arc::new(FailingStore)));
        let (i0, mut rx0) = connect(&fx, 1, 0);
        drain_frames(&mut rx0);

        fx.hub
            .handle_frame(i0, &json!({"op": 2, "d": {"type": 2, "data": "boom"}}).to_string())
            .await;

        let frames = drain_frames(&mut rx0);
        let ack = frames.iter().find(|f| f["op"] == 2).unwrap();
        assert_eq!(ack["d"]["ok"], false);
        assert_eq!(ack["d"]["code"], GenericClose::ServerError.as_u8());
        assert!(fx.hub.get_cluster(i0).is_some());
    }

    #[tokio::test]
    async fn test_broadcast_relay_resolves_exactly_once() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 3, 0);
        let (i1, mut rx1) = connect(&fx, 3, 1);
        let (i2, mut rx2) = connect(&fx, 3, 2);
        for rx in [&mut rx0, &mut rx1, &mut rx2] {
            drain_frames(rx);
        }

        fx.hub
            .handle_frame(i0, &json!({"op": 3, "d": {"to": "all", "data": "ping"}}).to_string())
            .await;

        // Every member, initiator included, gets the propagate.
        let id = {
            let frames = drain_frames(&mut rx1);
            let propagate = frames.iter().find(|f| f["op"] == 3).unwrap();
            assert_eq!(propagate["d"]["data"], "ping");
            propagate["d"]["id"].as_str().unwrap().to_string()
        };
        let frames = drain_frames(&mut rx0);
        assert!(frames.iter().any(|f| f["op"] == 3));
        let confirm = frames.iter().find(|f| f["op"] == 5).unwrap();
        assert_eq!(confirm["d"]["id"], json!(id));

        for (index, reply) in [(i0, "a"), (i1, "b")] {
            fx.hub
                .handle_frame(index, &json!({"op": 4, "d": {"id": id, "data": reply}}).to_string())
                .await;
        }
        assert!(drain_frames(&mut rx0).iter().all(|f| f["op"] != 4));

        fx.hub
            .handle_frame(i2, &json!({"op": 4, "d": {"id": id, "data": "c"}}).to_string())
            .await;

        let frames = drain_frames(&mut rx0);
        let results: Vec<&Value> = frames.iter().filter(|f| f["op"] == 4).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["d"]["data"], json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_single_target_relay_and_late_return() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 2, 0);
        let (i1, mut rx1) = connect(&fx, 2, 1);
        drain_frames(&mut rx0);
        drain_frames(&mut rx1);

        fx.hub
            .handle_frame(i0, &json!({"op": 3, "d": {"to": 1, "data": "q"}}).to_string())
            .await;
        let frames = drain_frames(&mut rx1);
        let id = frames.iter().find(|f| f["op"] == 3).unwrap()["d"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        fx.hub
            .handle_frame(i1, &json!({"op": 4, "d": {"id": id, "data": "answer"}}).to_string())
            .await;
        let frames = drain_frames(&mut rx0);
        let result = frames.iter().find(|f| f["op"] == 4).unwrap();
        assert_eq!(result["d"]["data"], "answer");

        // Late second return: instance is gone, silently ignored.
        fx.hub
            .handle_frame(i1, &json!({"op": 4, "d": {"id": id, "data": "again"}}).to_string())
            .await;
        assert!(fx.hub.get_cluster(i1).is_some());
        assert!(drain_frames(&mut rx0).iter().all(|f| f["op"] != 4));
    }

    #[tokio::test]
    async fn test_relay_to_unconnected_target_is_invalid_cluster() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 3, 0);

        fx.hub
            .handle_frame(i0, &json!({"op": 3, "d": {"to": 2, "data": "q"}}).to_string())
            .await;
        assert_eq!(drain_close(&mut rx0), Some(CloseCode::InvalidCluster));
    }

    #[tokio::test]
    async fn test_unaddressed_return_closes_with_invalid_relay_id() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 3, 0);
        let (_, _rx1) = connect(&fx, 3, 1);
        let (i2, mut rx2) = connect(&fx, 3, 2);
        drain_frames(&mut rx0);

        fx.hub
            .handle_frame(i0, &json!({"op": 3, "d": {"to": 1, "data": "q"}}).to_string())
            .await;
        let frames = drain_frames(&mut rx0);
        let id = frames.iter().find(|f| f["op"] == 5).unwrap()["d"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        fx.hub
            .handle_frame(i2, &json!({"op": 4, "d": {"id": id, "data": "sneak"}}).to_string())
            .await;
        assert_eq!(drain_close(&mut rx2), Some(CloseCode::InvalidRelayId));
    }

    #[tokio::test]
    async fn test_departure_settles_broadcast_relay() {
        let fx = fixture();
        let (i0, mut rx0) = connect(&fx, 2, 0);
        let (i1, _rx1) = connect(&fx, 2, 1);
        drain_frames(&mut rx0);

        fx.hub
            .handle_frame(i0, &json!({"op": 3, "d": {"to": "all", "data": "ping"}}).to_string())
            .await;
        let frames = drain_frames(&mut rx0);
        let id = frames.iter().find(|f| f["op"] == 5).unwrap()["d"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        fx.hub
            .handle_frame(i0, &json!({"op": 4, "d": {"id": id, "data": "mine"}}).to_string())
            .await;

        fx.hub.disconnect_cluster(i1, GenericClose::ServerRestarting);

        let frames = drain_frames(&mut rx0);
        let result = frames.iter().find(|f| f["op"] == 4).unwrap();
        assert_eq!(result["d"]["data"], json!(["mine", null]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_evicts() {
        let config = HubConfig {
            heartbeat_timeout_ms: 1_000,
            ..HubConfig::default()
        };
        let fx = fixture_with(config, None);
        let (index, mut rx) = connect(&fx, 1, 0);

        // Let the spawned timer register its sleep before the paused
        // clock moves, or its deadline is computed post-advance.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1_100)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(drain_close(&mut rx), Some(CloseCode::HeartbeatTimeout));
        assert!(fx.hub.get_cluster(index).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_rearms_without_double_fire() {
        let config = HubConfig {
            heartbeat_timeout_ms: 1_000,
            ..HubConfig::default()
        };
        let fx = fixture_with(config, None);
        let (index, mut rx) = connect(&fx, 1, 0);

        // Let each freshly armed timer register its sleep before the
        // paused clock moves, or its deadline is computed post-advance.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(600)).await;
        fx.hub.handle_frame(index, r#"{"op": 0}"#).await;
        tokio::task::yield_now().await;

        // Past the original deadline, inside the refreshed one.
        tokio::time::advance(Duration::from_millis(600)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(fx.hub.get_cluster(index).is_some());
        let frames = drain_frames(&mut rx);
        assert!(frames.iter().any(|f| f["op"] == 0));

        tokio::time::advance(Duration::from_millis(600)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(drain_close(&mut rx), Some(CloseCode::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_server_closing_evicts_all_with_restart_code() {
        let fx = fixture();
        let (_, mut rx0) = connect(&fx, 2, 0);
        let (_, mut rx1) = connect(&fx, 2, 1);

        fx.hub.server_closing();
        assert_eq!(drain_close(&mut rx0), Some(CloseCode::ServiceRestart));
        assert_eq!(drain_close(&mut rx1), Some(CloseCode::ServiceRestart));
        assert!(fx.hub.get_all_clusters().is_empty());
    }

    #[tokio::test]
    async fn test_events_track_lifecycle() {
        let fx = fixture();
        let mut events = fx.hub.subscribe();

        let (index, _rx0) = connect(&fx, 1, 0);
        match events.try_recv().unwrap() {
            ServiceEvent::Authenticated {
                index: i,
                fleet_size,
                user,
            } => {
                assert_eq!((i, fleet_size), (index, 1));
                assert_eq!(user, "grafana");
            }
            other => panic!("expected Authenticated, got {other:?}"),
        }

        fx.hub.evict(index, CloseCode::Abnormal);
        match events.try_recv().unwrap() {
            ServiceEvent::Disconnected { index: i, code } => {
                assert_eq!((i, code), (index, CloseCode::Abnormal));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }

        // Duplicate eviction is silently ignored.
        fx.hub.evict(index, CloseCode::Abnormal);
        assert!(events.try_recv().is_err());
    }
}

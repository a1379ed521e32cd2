//! Hub observability metrics
//!
//! Prometheus-compatible metrics covering:
//! - Connection lifecycle (handshakes, evictions)
//! - Registered member count
//! - Aggregation rounds (flushes, rejected shards)
//! - In-flight relay instances

/// Record a completed handshake.
pub fn record_handshake(user: &str) {
    metrics::counter!(
        "statshub_handshakes_total",
        "user" => user.to_string(),
    )
    .increment(1);
}

/// Record a handshake rejection.
pub fn record_handshake_rejected(code: &'static str) {
    metrics::counter!(
        "statshub_handshake_rejections_total",
        "code" => code,
    )
    .increment(1);
}

/// Record an eviction with its close code.
pub fn record_eviction(code: &'static str) {
    metrics::counter!(
        "statshub_evictions_total",
        "code" => code,
    )
    .increment(1);
}

/// Update the registered member gauge.
pub fn update_member_count(count: usize) {
    metrics::gauge!("statshub_members").set(count as f64);
}

/// Record an accepted metric shard.
pub fn record_shard_accepted() {
    metrics::counter!("statshub_shards_accepted_total").increment(1);
}

/// Record a rejected metric shard (duplicate or schema-invalid).
pub fn record_shard_rejected(reason: &'static str) {
    metrics::counter!(
        "statshub_shards_rejected_total",
        "reason" => reason,
    )
    .increment(1);
}

/// Record a completed aggregation flush.
pub fn record_aggregation_flush(status: &'static str) {
    metrics::counter!(
        "statshub_aggregation_flushes_total",
        "status" => status,
    )
    .increment(1);
}

/// Update the in-flight relay instance gauge.
pub fn update_relay_instances(count: usize) {
    metrics::gauge!("statshub_relay_instances").set(count as f64);
}

/// Record a resolved relay instance.
pub fn record_relay_resolved(target: &'static str) {
    metrics::counter!(
        "statshub_relays_resolved_total",
        "target" => target,
    )
    .increment(1);
}

/// Record a store write from the hub.
pub fn record_store_write(store: &'static str, status: &'static str) {
    metrics::counter!(
        "statshub_store_writes_total",
        "store" => store,
        "status" => status,
    )
    .increment(1);
}

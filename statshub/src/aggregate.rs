//! Data aggregation barrier.
//!
//! Accumulates one metric shard per cluster index. When every index in
//! `[0, fleet_size)` holds a shard, the round is complete: the shards are
//! merged value-wise into one combined record and the set resets. One
//! shard per cluster per round, no overwrite.

use serde_json::{Map, Value};

/// Pending shard set for the current aggregation round.
///
/// Shards are kept in receipt order; the merged record's per-field value
/// collections preserve that order rather than being keyed by cluster
/// index.
#[derive(Debug, Default)]
pub struct AggregationBarrier {
    shards: Vec<(u16, Value)>,
}

impl AggregationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Whether the given index already reported this round.
    pub fn contains(&self, index: u16) -> bool {
        self.shards.iter().any(|(i, _)| *i == index)
    }

    /// Store a shard under its cluster index. Returns `false` without
    /// touching the stored shard when the index already reported.
    pub fn insert(&mut self, index: u16, shard: Value) -> bool {
        if self.contains(index) {
            return false;
        }
        self.shards.push((index, shard));
        true
    }

    /// Discard the shard reported by the given index, if any. Called on
    /// member departure so a stale shard never blocks the slot for a
    /// reconnect or outlives its fleet generation.
    pub fn remove(&mut self, index: u16) -> bool {
        let before = self.shards.len();
        self.shards.retain(|(i, _)| *i != index);
        self.shards.len() != before
    }

    /// A round completes exactly when every index in `[0, fleet_size)`
    /// has a shard.
    pub fn is_complete(&self, fleet_size: u16) -> bool {
        self.shards.len() == usize::from(fleet_size)
            && (0..fleet_size).all(|index| self.contains(index))
    }

    /// Merge the collected shards value-wise: each top-level field name
    /// present in any shard maps to the ordered collection of per-cluster
    /// values for that field, in receipt order.
    pub fn merge(&self) -> Value {
        let mut merged: Map<String, Value> = Map::new();
        for (_, shard) in &self.shards {
            let Some(fields) = shard.as_object() else {
                continue;
            };
            for (name, value) in fields {
                match merged
                    .entry(name.clone())
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    Value::Array(values) => values.push(value.clone()),
                    _ => unreachable!("merge entries are always arrays"),
                }
            }
        }
        Value::Object(merged)
    }

    /// Reset for the next round. No index is remembered across resets.
    pub fn clear(&mut self) {
        self.shards.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_shard_rejected_and_first_retained() {
        let mut barrier = AggregationBarrier::new();
        assert!(barrier.insert(0, json!({"count": 1})));
        assert!(!barrier.insert(0, json!({"count": 99})));

        assert_eq!(barrier.len(), 1);
        assert_eq!(barrier.merge(), json!({"count": [1]}));
    }

    #[test]
    fn test_completion_requires_every_index() {
        let mut barrier = AggregationBarrier::new();
        barrier.insert(0, json!({"count": 1}));
        barrier.insert(2, json!({"count": 3}));
        assert!(!barrier.is_complete(3));

        barrier.insert(1, json!({"count": 2}));
        assert!(barrier.is_complete(3));
    }

    #[test]
    fn test_merge_preserves_receipt_order() {
        let mut barrier = AggregationBarrier::new();
        barrier.insert(1, json!({"count": 2, "name": "b"}));
        barrier.insert(0, json!({"count": 1}));

        assert_eq!(barrier.merge(), json!({"count": [2, 1], "name": ["b"]}));
    }

    #[test]
    fn test_remove_frees_the_slot() {
        let mut barrier = AggregationBarrier::new();
        barrier.insert(0, json!({"count": 1}));
        barrier.insert(1, json!({"count": 2}));

        assert!(barrier.remove(0));
        assert!(!barrier.remove(0));
        assert!(!barrier.contains(0));
        assert!(barrier.insert(0, json!({"count": 3})));
        assert_eq!(barrier.merge(), json!({"count": [2, 3]}));
    }

    #[test]
    fn test_clear_forgets_every_index() {
        let mut barrier = AggregationBarrier::new();
        barrier.insert(0, json!({"count": 1}));
        barrier.insert(1, json!({"count": 2}));
        barrier.clear();

        assert!(barrier.is_empty());
        assert!(!barrier.contains(0));
        assert!(barrier.insert(0, json!({"count": 5})));
    }

    #[test]
    fn test_sparse_indices_never_complete() {
        let mut barrier = AggregationBarrier::new();
        barrier.insert(1, json!({}));
        barrier.insert(2, json!({}));
        assert!(!barrier.is_complete(2));
    }
}

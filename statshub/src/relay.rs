//! Cross-Cluster-Communication (CCC) relay.
//!
//! One cluster queries one or all others through the hub: the relay
//! creates an instance keyed by a fresh id, fans the request out, collects
//! returns, and forwards the result to the initiator exactly once. A relay
//! instance lives only in memory and only until its response set is
//! complete; there is no client-requested cancellation.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::protocol::RelayTarget;

/// Completed response set, shaped by the instance's target.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSet {
    /// Single-target instance: the one returned payload.
    Single(String),
    /// Broadcast instance: one slot per cluster index, `None` for slots
    /// that never responded (departed mid-flight or were never addressed).
    Broadcast(Vec<Option<String>>),
}

impl ResponseSet {
    /// Wire form forwarded to the initiator: scalar string or
    /// index-ordered array with nulls.
    pub fn into_value(self) -> Value {
        match self {
            ResponseSet::Single(data) => Value::String(data),
            ResponseSet::Broadcast(slots) => Value::Array(
                slots
                    .into_iter()
                    .map(|slot| slot.map_or(Value::Null, Value::String))
                    .collect(),
            ),
        }
    }
}

/// Outcome of processing a relay return.
#[derive(Debug, PartialEq)]
pub enum ReturnOutcome {
    /// No instance with that id. Covers both never-existed ids and
    /// returns arriving after resolution; both are ignored.
    UnknownId,
    /// The responder was never addressed by this instance.
    NotAddressed,
    /// Response recorded, more slots outstanding.
    Pending,
    /// The response set is complete; the instance has been destroyed.
    /// Carries the initiator index the result must be forwarded to.
    Complete(u16, ResponseSet),
}

/// One in-flight relay operation.
#[derive(Debug)]
pub struct RelayInstance {
    pub id: String,
    pub initiator: u16,
    pub target: RelayTarget,
    pub payload: String,
    /// Indices addressed at creation time.
    addressed: HashSet<u16>,
    /// Broadcast responses, one slot per fleet index.
    responses: Vec<Option<String>>,
    /// Addressed indices that have responded or departed.
    settled: HashSet<u16>,
}

impl RelayInstance {
    fn new(
        initiator: u16,
        target: RelayTarget,
        payload: String,
        fleet_size: u16,
        addressed: Vec<u16>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            initiator,
            target,
            payload,
            addressed: addressed.into_iter().collect(),
            responses: vec![None; usize::from(fleet_size)],
            settled: HashSet::new(),
        }
    }

    fn is_settled(&self) -> bool {
        self.addressed.iter().all(|i| self.settled.contains(i))
    }

    fn into_response_set(self) -> ResponseSet {
        match self.target {
            RelayTarget::All => ResponseSet::Broadcast(self.responses),
            RelayTarget::Index(_) => {
                // Single-target instances resolve on the first return, so
                // exactly one slot is filled.
                let data = self
                    .responses
                    .into_iter()
                    .flatten()
                    .next()
                    .unwrap_or_default();
                ResponseSet::Single(data)
            }
        }
    }
}

/// Table of in-flight relay instances keyed by id.
#[derive(Debug, Default)]
pub struct RelayTable {
    instances: HashMap<String, RelayInstance>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Create an instance and return a borrow of it (for the propagate
    /// fan-out and the confirm frame). `addressed` is the membership the
    /// hub resolved for the target at creation time.
    pub fn begin(
        &mut self,
        initiator: u16,
        target: RelayTarget,
        payload: String,
        fleet_size: u16,
        addressed: Vec<u16>,
    ) -> &RelayInstance {
        let instance = RelayInstance::new(initiator, target, payload, fleet_size, addressed);
        let id = instance.id.clone();
        self.instances.entry(id).or_insert(instance)
    }

    /// Process a relay return from `from`.
    pub fn handle_return(&mut self, id: &str, from: u16, data: String) -> ReturnOutcome {
        let Some(instance) = self.instances.get_mut(id) else {
            return ReturnOutcome::UnknownId;
        };
        if !instance.addressed.contains(&from) {
            return ReturnOutcome::NotAddressed;
        }
        // First response per responder wins; repeats are ignored.
        if instance.settled.insert(from) {
            instance.responses[usize::from(from)] = Some(data);
        }

        if instance.is_settled() {
            let instance = self
                .instances
                .remove(id)
                .expect("instance present under this id");
            ReturnOutcome::Complete(instance.initiator, instance.into_response_set())
        } else {
            ReturnOutcome::Pending
        }
    }

    /// Account for a member leaving the fleet: instances it initiated are
    /// dropped, single-target instances aimed at it are dropped, and
    /// broadcast instances mark its slot absent — possibly completing.
    ///
    /// Returns the instances that completed as `(initiator, id, set)`.
    pub fn member_departed(&mut self, index: u16) -> Vec<(u16, String, ResponseSet)> {
        self.instances.retain(|_, instance| {
            instance.initiator != index && instance.target != RelayTarget::Index(index)
        });

        let completed_ids: Vec<String> = self
            .instances
            .iter_mut()
            .filter_map(|(id, instance)| {
                if instance.addressed.contains(&index) {
                    instance.settled.insert(index);
                    if instance.is_settled() {
                        return Some(id.clone());
                    }
                }
                None
            })
            .collect();

        completed_ids
            .into_iter()
            .filter_map(|id| {
                self.instances
                    .remove(&id)
                    .map(|instance| (instance.initiator, id, instance.into_response_set()))
            })
            .collect()
    }
}

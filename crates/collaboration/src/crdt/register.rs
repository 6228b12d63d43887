use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::Crdt;
use crate::{ClockService, ReplicaId, VectorClock};

/// Last-writer-wins register holding an arbitrary JSON value
///
/// The greater `timestamp` wins; equal timestamps fall back to the greater
/// `replica_id`, then to the canonical JSON text of the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister {
    pub value: serde_json::Value,
    pub timestamp: u64,
    pub replica_id: ReplicaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
}

impl LwwRegister {
    pub fn new(value: serde_json::Value, timestamp: u64, replica_id: ReplicaId) -> Self {
        Self {
            value,
            timestamp,
            replica_id,
            vector_clock: None,
        }
    }

    pub fn get(&self) -> &serde_json::Value {
        &self.value
    }

    /// Local write stamped by the replica's clock service
    pub fn write(&mut self, value: serde_json::Value, replica: &ReplicaId, clocks: &mut ClockService) {
        clocks.observe(
            self.timestamp,
            self.vector_clock.as_ref().unwrap_or(&VectorClock::new()),
        );
        self.timestamp = clocks.tick(replica);
        self.value = value;
        self.replica_id = replica.clone();
        self.vector_clock = Some(clocks.vector().clone());
    }

    fn precedence(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.replica_id.cmp(&other.replica_id))
            .then_with(|| self.value.to_string().cmp(&other.value.to_string()))
    }
}

impl Crdt for LwwRegister {
    fn merge(&mut self, other: &Self) {
        if other.precedence(self) == Ordering::Greater {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.replica_id = other.replica_id.clone();
        }

        self.vector_clock = match (self.vector_clock.take(), &other.vector_clock) {
            (Some(mine), Some(theirs)) => Some(mine.merged(theirs)),
            (Some(mine), None) => Some(mine),
            (None, theirs) => theirs.clone(),
        };
    }
}

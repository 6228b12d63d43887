use serde::{Deserialize, Serialize};

use super::Crdt;
use crate::{ClockService, ReplicaId};

/// One addition record; `removed` is a tombstone that never reverts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrSetElement {
    pub value: serde_json::Value,
    pub timestamp: u64,
    pub replica_id: ReplicaId,
    pub uid: String,
    #[serde(default)]
    pub removed: bool,
}

/// Observed-remove set with add-wins semantics
///
/// Removing a value tombstones only the additions the remover has seen, so a
/// concurrent re-add under a fresh uid survives the merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OrSetRepr")]
pub struct OrSet {
    /// Sorted by uid
    elements: Vec<OrSetElement>,
}

/// Wire form; elements from the wire may arrive unsorted or duplicated
#[derive(Deserialize)]
struct OrSetRepr {
    #[serde(default)]
    elements: Vec<OrSetElement>,
}

impl From<OrSetRepr> for OrSet {
    fn from(repr: OrSetRepr) -> Self {
        let mut set = OrSet::new();
        for element in repr.elements {
            set.insert(element);
        }
        set
    }
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` under a fresh uid and return the uid
    pub fn add(
        &mut self,
        value: serde_json::Value,
        replica: &ReplicaId,
        clocks: &mut ClockService,
    ) -> String {
        let uid = uuid::Uuid::new_v4().to_string();
        let timestamp = clocks.tick(replica);
        self.insert(OrSetElement {
            value,
            timestamp,
            replica_id: replica.clone(),
            uid: uid.clone(),
            removed: false,
        });
        uid
    }

    /// Insert an addition record with a caller-chosen uid
    pub fn insert(&mut self, element: OrSetElement) {
        match self.position(&element.uid) {
            Ok(index) => merge_element(&mut self.elements[index], &element),
            Err(index) => self.elements.insert(index, element),
        }
    }

    /// Tombstone every observed addition of `value`; returns how many
    pub fn remove(&mut self, value: &serde_json::Value) -> usize {
        let mut removed = 0;
        for element in &mut self.elements {
            if !element.removed && &element.value == value {
                element.removed = true;
                removed += 1;
            }
        }
        removed
    }

    pub fn remove_uid(&mut self, uid: &str) -> bool {
        match self.position(uid) {
            Ok(index) if !self.elements[index].removed => {
                self.elements[index].removed = true;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, value: &serde_json::Value) -> bool {
        self.elements
            .iter()
            .any(|element| !element.removed && &element.value == value)
    }

    pub fn contains_uid(&self, uid: &str) -> bool {
        self.position(uid)
            .map(|index| !self.elements[index].removed)
            .unwrap_or(false)
    }

    /// Distinct live values, in uid order of their first live record
    pub fn values(&self) -> Vec<&serde_json::Value> {
        let mut out: Vec<&serde_json::Value> = Vec::new();
        for element in self.elements.iter().filter(|e| !e.removed) {
            if !out.contains(&&element.value) {
                out.push(&element.value);
            }
        }
        out
    }

    pub fn elements(&self) -> &[OrSetElement] {
        &self.elements
    }

    fn position(&self, uid: &str) -> std::result::Result<usize, usize> {
        self.elements
            .binary_search_by(|element| element.uid.as_str().cmp(uid))
    }
}

impl Crdt for OrSet {
    fn merge(&mut self, other: &Self) {
        for element in &other.elements {
            self.insert(element.clone());
        }
    }
}

fn merge_element(into: &mut OrSetElement, from: &OrSetElement) {
    into.removed |= from.removed;
    // Records under one uid should be identical; keep the earliest if not
    if (from.timestamp, &from.replica_id) < (into.timestamp, &into.replica_id) {
        into.value = from.value.clone();
        into.timestamp = from.timestamp;
        into.replica_id = from.replica_id.clone();
    }
}

/// Lamport and vector clocks for causality tracking
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ReplicaId;

/// Lamport timestamp for causality tracking
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LamportClock(pub u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    /// Advance the clock and return the new time
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    /// Fold in a time observed on another replica without issuing a new one
    pub fn observe(&mut self, observed: u64) {
        self.0 = self.0.max(observed);
    }

    /// Receive rule: `local = max(local, observed) + 1`
    pub fn update(&mut self, observed: u64) -> u64 {
        self.observe(observed);
        self.tick()
    }

    pub fn time(&self) -> u64 {
        self.0
    }
}

/// Result of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalOrder {
    Before,
    After,
    Concurrent,
    Equal,
}

/// Vector clock for tracking causal dependencies
///
/// Missing entries read as zero. Entries are only ever created by
/// `increment` or `merge`, so two clocks describing the same history compare
/// equal structurally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Increment the entry for a replica and return its new value
    pub fn increment(&mut self, replica: &ReplicaId) -> u64 {
        let entry = self.clocks.entry(replica.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Get the current value for a replica
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Merge with another vector clock (pointwise max)
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &count) in &other.clocks {
            let current = self.clocks.entry(replica.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    /// Pure form of [`VectorClock::merge`]
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for replica in self.clocks.keys().chain(other.clocks.keys()) {
            let mine = self.get(replica);
            let theirs = other.get(replica);
            if mine < theirs {
                less = true;
            }
            if mine > theirs {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Check if this clock happened before another
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Check if this clock is concurrent with another
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.clocks.iter().map(|(r, c)| (r, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self {
            clocks: entries
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(replica, count)| (ReplicaId::from(replica), count))
                .collect(),
        }
    }
}

/// Per-process clock source: one Lamport clock plus a vector clock of the
/// events this process has issued or observed.
#[derive(Debug, Clone, Default)]
pub struct ClockService {
    lamport: LamportClock,
    vector: VectorClock,
}

impl ClockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new Lamport time on behalf of `replica`
    pub fn tick(&mut self, replica: &ReplicaId) -> u64 {
        self.vector.increment(replica);
        self.lamport.tick()
    }

    /// Record causal metadata seen on an inbound update
    pub fn observe(&mut self, lamport: u64, vector: &VectorClock) {
        self.lamport.observe(lamport);
        self.vector.merge(vector);
    }

    pub fn lamport(&self) -> u64 {
        self.lamport.time()
    }

    pub fn vector(&self) -> &VectorClock {
        &self.vector
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Crdt;
use crate::ReplicaId;

/// Grow-only counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    pub counts: BTreeMap<ReplicaId, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, replica: &ReplicaId, by: u64) {
        if by > 0 {
            bump(self.counts.entry(replica.clone()).or_insert(0), by);
        }
    }

    /// Total across replicas, saturating at `u64::MAX`
    pub fn value(&self) -> u64 {
        self.counts
            .values()
            .fold(0u64, |total, &count| total.saturating_add(count))
    }
}

impl Crdt for GCounter {
    fn merge(&mut self, other: &Self) {
        merge_counts(&mut self.counts, &other.counts);
    }
}

impl<const N: usize> From<[(&str, u64); N]> for GCounter {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self {
            counts: entries
                .into_iter()
                .map(|(replica, count)| (ReplicaId::from(replica), count))
                .collect(),
        }
    }
}

/// Counter supporting increments and decrements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    pub positive: BTreeMap<ReplicaId, u64>,
    pub negative: BTreeMap<ReplicaId, u64>,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, replica: &ReplicaId, by: u64) {
        if by > 0 {
            bump(self.positive.entry(replica.clone()).or_insert(0), by);
        }
    }

    pub fn decrement(&mut self, replica: &ReplicaId, by: u64) {
        if by > 0 {
            bump(self.negative.entry(replica.clone()).or_insert(0), by);
        }
    }

    /// Net value, clamped to the `i64` range
    pub fn value(&self) -> i64 {
        let positive: i128 = self.positive.values().map(|&count| count as i128).sum();
        let negative: i128 = self.negative.values().map(|&count| count as i128).sum();
        (positive - negative).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Crdt for PnCounter {
    fn merge(&mut self, other: &Self) {
        merge_counts(&mut self.positive, &other.positive);
        merge_counts(&mut self.negative, &other.negative);
    }
}

fn bump(count: &mut u64, by: u64) {
    *count = count.saturating_add(by);
}

fn merge_counts(into: &mut BTreeMap<ReplicaId, u64>, from: &BTreeMap<ReplicaId, u64>) {
    for (replica, &count) in from {
        let current = into.entry(replica.clone()).or_insert(0);
        *current = (*current).max(count);
    }
}

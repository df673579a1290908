//! Operation identities and state vectors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Replica origin identifier. Drawn at random per document instance.
pub type ClientId = u64;

/// Globally unique identity of a content unit or delete operation.
///
/// Clocks start at 1 and are contiguous per origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub origin: ClientId,
    pub clock: u64,
}

impl UnitId {
    pub fn new(origin: ClientId, clock: u64) -> Self {
        Self { origin, clock }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}@{}", self.origin, self.clock)
    }
}

/// Highest contiguous clock integrated from each origin.
///
/// A `BTreeMap` keeps the encoding deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ClientId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen from `origin` (0 if none).
    pub fn get(&self, origin: ClientId) -> u64 {
        self.0.get(&origin).copied().unwrap_or(0)
    }

    /// Whether the operation `id` is covered by this vector.
    pub fn contains(&self, id: UnitId) -> bool {
        id.clock <= self.get(id.origin)
    }

    /// Raise the entry for `origin` to `clock`. Never lowers it.
    pub fn advance(&mut self, origin: ClientId, clock: u64) {
        let entry = self.0.entry(origin).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(origin, clock)| self.get(*origin) >= *clock)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.0.iter().map(|(o, c)| (*o, *c))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all clocks: the number of operations integrated.
    pub fn total_ops(&self) -> u64 {
        self.0.values().sum()
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ClientId, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (origin, clock) in iter {
            sv.advance(origin, clock);
        }
        sv
    }
}

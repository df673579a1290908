//! Content units, operations and update batches.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::id::{ClientId, StateVector, UnitId};

/// Value held by one position of the sequence.
///
/// Code buffers use one `Char` per position; notes may store whole
/// paragraphs as a `Block`, which is inserted and deleted atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitValue {
    Char(char),
    Block(String),
}

impl fmt::Display for UnitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitValue::Char(c) => write!(f, "{c}"),
            UnitValue::Block(s) => f.write_str(s),
        }
    }
}

impl From<char> for UnitValue {
    fn from(c: char) -> Self {
        UnitValue::Char(c)
    }
}

/// A single element of the replicated sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: UnitId,
    pub value: UnitValue,
    /// Unit immediately left of this one on the author's replica at creation.
    pub left_origin: Option<UnitId>,
    /// Unit immediately right of this one on the author's replica at creation.
    pub right_origin: Option<UnitId>,
    pub deleted: bool,
}

/// One replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert(ContentUnit),
    /// Tombstone `target`. `id` is the delete's own clock tick.
    Delete { id: UnitId, target: UnitId },
}

impl Operation {
    /// Identity of the operation (the unit id for inserts).
    pub fn id(&self) -> UnitId {
        match self {
            Operation::Insert(unit) => unit.id,
            Operation::Delete { id, .. } => *id,
        }
    }
}

/// An ordered batch of operations.
///
/// Dependencies precede dependents, so a replica that has everything the
/// batch's author had can integrate it front to back without buffering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    ops: Vec<Operation>,
}

impl Update {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append all operations of `other`.
    pub fn extend(&mut self, other: Update) {
        self.ops.extend(other.ops);
    }

    /// Inclusive clock range covered per origin.
    pub fn clock_ranges(&self) -> BTreeMap<ClientId, (u64, u64)> {
        let mut ranges: BTreeMap<ClientId, (u64, u64)> = BTreeMap::new();
        for op in &self.ops {
            let id = op.id();
            ranges
                .entry(id.origin)
                .and_modify(|(lo, hi)| {
                    *lo = (*lo).min(id.clock);
                    *hi = (*hi).max(id.clock);
                })
                .or_insert((id.clock, id.clock));
        }
        ranges
    }

    /// Whether every operation is already covered by `sv`.
    pub fn covered_by(&self, sv: &StateVector) -> bool {
        self.ops.iter().all(|op| sv.contains(op.id()))
    }

    /// Drop operations whose id is in `ids`.
    pub fn without(mut self, ids: &HashSet<UnitId>) -> Update {
        self.ops.retain(|op| !ids.contains(&op.id()));
        self
    }

    pub fn op_ids(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.ops.iter().map(Operation::id)
    }
}

impl From<Vec<Operation>> for Update {
    fn from(ops: Vec<Operation>) -> Self {
        Self::new(ops)
    }
}

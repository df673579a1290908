//! The Document Engine: a YATA-ordered sequence with tombstones.
//!
//! Storage layout:
//! ```text
//! units:  [ u0 | u1 | u2 | u3 | ... ]     append-only arena, never shrinks
//! order:  [ 2, 0 ][ 3, 1, ... ]           document order as arena indices,
//!                                         in blocks with visible counts
//! index:  UnitId → arena index
//! ```
//!
//! References between units are ids resolved through `index`, never
//! pointers, so the structure has no cycles and encodes trivially.

use log::{debug, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use thiserror::Error;
use uuid::Uuid;

use super::id::{ClientId, StateVector, UnitId};
use super::order::OrderIndex;
use super::update::{ContentUnit, Operation, UnitValue, Update};

/// Buffered operations a replica holds before it starts refusing more.
pub const DEFAULT_PENDING_LIMIT: usize = 10_000;

/// Errors raised by local edits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),
    #[error("position {pos} out of bounds (len {len})")]
    OutOfBounds { pos: usize, len: usize },
}

/// Visible effect of integrating an operation.
///
/// Indices refer to the visible content at the moment the change was
/// applied; apply a list of changes in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentChange {
    Inserted { index: usize, value: UnitValue },
    Deleted { index: usize, value: UnitValue },
}

/// Result of [`Document::merge_update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merged {
    pub changes: Vec<ContentChange>,
    /// Operations integrated by this call, dependencies first. Includes
    /// buffered operations the update unblocked.
    pub integrated: Update,
    /// Blocked operations refused because the pending buffer was full.
    pub refused: usize,
}

enum Readiness {
    Ready,
    Duplicate,
    Blocked,
    /// A reference the state vector claims to have, but that is not a unit.
    Malformed(UnitId),
}

/// A replica of one shared document.
#[derive(Debug, Clone)]
pub struct Document {
    origin: ClientId,
    units: Vec<ContentUnit>,
    order: OrderIndex,
    index: HashMap<UnitId, u32>,
    state: StateVector,
    /// Integrated operations in integration order.
    history: Vec<Operation>,
    pending: Vec<Operation>,
    pending_ids: HashSet<UnitId>,
    pending_limit: usize,
    /// Deletes whose target has not arrived yet.
    orphan_deletes: HashSet<UnitId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document with a random origin id.
    pub fn new() -> Self {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        Self::with_origin((hi ^ lo).max(1))
    }

    /// Create an empty document with an explicit origin id.
    pub fn with_origin(origin: ClientId) -> Self {
        Self {
            origin,
            units: Vec::new(),
            order: OrderIndex::new(),
            index: HashMap::new(),
            state: StateVector::new(),
            history: Vec::new(),
            pending: Vec::new(),
            pending_ids: HashSet::new(),
            pending_limit: DEFAULT_PENDING_LIMIT,
            orphan_deletes: HashSet::new(),
        }
    }

    /// Cap the pending buffer at `limit` operations.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    /// Rebuild a replica from a full-state update.
    pub fn from_snapshot(snapshot: &Update) -> Self {
        let mut doc = Self::new();
        doc.merge(snapshot);
        doc
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert `value` right after `after` (`None` = document start).
    pub fn apply_local_insert(
        &mut self,
        after: Option<UnitId>,
        value: impl Into<UnitValue>,
    ) -> Result<Update, CrdtError> {
        let op = self.local_insert_op(after, value.into())?;
        Ok(Update::new(vec![op]))
    }

    /// Tombstone the unit `unit_id`.
    pub fn apply_local_delete(&mut self, unit_id: UnitId) -> Result<Update, CrdtError> {
        let op = self.local_delete_op(unit_id)?;
        Ok(Update::new(vec![op]))
    }

    /// Insert a run of values at visible position `pos`.
    pub fn insert_at<I>(&mut self, pos: usize, values: I) -> Result<Update, CrdtError>
    where
        I: IntoIterator<Item = UnitValue>,
    {
        let len = self.len();
        if pos > len {
            return Err(CrdtError::OutOfBounds { pos, len });
        }
        let mut after = match pos {
            0 => None,
            _ => Some(self.unit_at(pos - 1)?),
        };
        let mut ops = Vec::new();
        for value in values {
            let op = self.local_insert_op(after, value)?;
            after = Some(op.id());
            ops.push(op);
        }
        Ok(Update::new(ops))
    }

    /// Insert `text` one character per unit at visible position `pos`.
    pub fn insert_text(&mut self, pos: usize, text: &str) -> Result<Update, CrdtError> {
        self.insert_at(pos, text.chars().map(UnitValue::Char))
    }

    /// Delete the visible positions in `range`.
    pub fn delete_range(&mut self, range: Range<usize>) -> Result<Update, CrdtError> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(CrdtError::OutOfBounds { pos: range.end, len });
        }
        let count = range.end - range.start;
        let targets: Vec<UnitId> = match self.order.nth_visible(range.start) {
            Some((first, _)) if count > 0 => self
                .order
                .iter_from(first)
                .map(|a| &self.units[a as usize])
                .filter(|u| !u.deleted)
                .take(count)
                .map(|u| u.id)
                .collect(),
            _ => Vec::new(),
        };
        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            ops.push(self.local_delete_op(target)?);
        }
        Ok(Update::new(ops))
    }

    fn next_id(&self) -> UnitId {
        UnitId::new(self.origin, self.state.get(self.origin) + 1)
    }

    fn local_insert_op(
        &mut self,
        after: Option<UnitId>,
        value: UnitValue,
    ) -> Result<Operation, CrdtError> {
        let right_origin = match after {
            None => self.order.get(0).map(|a| self.units[a as usize].id),
            Some(left) => {
                let pos = self.locate(left).ok_or(CrdtError::UnknownUnit(left))?;
                self.order.get(pos + 1).map(|a| self.units[a as usize].id)
            }
        };
        let op = Operation::Insert(ContentUnit {
            id: self.next_id(),
            value,
            left_origin: after,
            right_origin,
            deleted: false,
        });
        self.integrate(op.clone(), &mut Vec::new());
        Ok(op)
    }

    fn local_delete_op(&mut self, target: UnitId) -> Result<Operation, CrdtError> {
        if !self.index.contains_key(&target) {
            return Err(CrdtError::UnknownUnit(target));
        }
        let op = Operation::Delete { id: self.next_id(), target };
        self.integrate(op.clone(), &mut Vec::new());
        Ok(op)
    }

    // ─── Remote merge ─────────────────────────────────────────────────

    /// Integrate a remote update, returning the visible changes.
    ///
    /// Idempotent, commutative and associative. Operations that cannot be
    /// placed yet are buffered and retried after every integration.
    pub fn merge(&mut self, update: &Update) -> Vec<ContentChange> {
        let mut changes = Vec::new();
        self.merge_into(update, &mut changes);
        changes
    }

    /// Like [`merge`](Self::merge), also reporting what was integrated and
    /// what the full pending buffer refused.
    pub fn merge_update(&mut self, update: &Update) -> Merged {
        let mark = self.history.len();
        let mut changes = Vec::new();
        let refused = self.merge_into(update, &mut changes);
        Merged {
            changes,
            integrated: Update::new(self.history[mark..].to_vec()),
            refused,
        }
    }

    fn merge_into(&mut self, update: &Update, changes: &mut Vec<ContentChange>) -> usize {
        let mut progressed = false;
        let mut refused = 0;

        for op in update.ops() {
            match self.readiness(op) {
                Readiness::Ready => {
                    self.integrate(op.clone(), changes);
                    progressed = true;
                }
                Readiness::Duplicate => {}
                Readiness::Blocked => {
                    if !self.buffer(op.clone()) {
                        refused += 1;
                    }
                }
                Readiness::Malformed(reference) => {
                    warn!("Dropping op {} with malformed reference {reference}", op.id());
                }
            }
        }

        if progressed {
            self.drain_pending(changes);
        }
        if refused > 0 {
            warn!(
                "Pending buffer full ({} ops), refused {refused} blocked ops",
                self.pending_limit
            );
        }
        refused
    }

    /// All operations `remote` has not seen, dependencies first.
    pub fn diff(&self, remote: &StateVector) -> Update {
        Update::new(
            self.history
                .iter()
                .filter(|op| !remote.contains(op.id()))
                .cloned()
                .collect(),
        )
    }

    /// Full state as a single update.
    pub fn snapshot(&self) -> Update {
        self.diff(&StateVector::new())
    }

    /// Hold `op` until it can be placed. False when the buffer is full.
    fn buffer(&mut self, op: Operation) -> bool {
        if self.pending_ids.contains(&op.id()) {
            return true;
        }
        if self.pending.len() >= self.pending_limit {
            return false;
        }
        debug!("Buffering op {} until its dependencies arrive", op.id());
        self.pending_ids.insert(op.id());
        self.pending.push(op);
        true
    }

    fn drain_pending(&mut self, changes: &mut Vec<ContentChange>) {
        while !self.pending.is_empty() {
            let mut progressed = false;
            for op in std::mem::take(&mut self.pending) {
                match self.readiness(&op) {
                    Readiness::Ready => {
                        self.pending_ids.remove(&op.id());
                        self.integrate(op, changes);
                        progressed = true;
                    }
                    Readiness::Duplicate => {
                        self.pending_ids.remove(&op.id());
                    }
                    Readiness::Blocked => self.pending.push(op),
                    Readiness::Malformed(reference) => {
                        self.pending_ids.remove(&op.id());
                        warn!("Dropping op {} with malformed reference {reference}", op.id());
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn readiness(&self, op: &Operation) -> Readiness {
        let id = op.id();
        let seen = self.state.get(id.origin);
        if id.clock <= seen {
            return Readiness::Duplicate;
        }
        if id.clock != seen + 1 {
            return Readiness::Blocked;
        }
        match op {
            Operation::Insert(unit) => {
                for reference in [unit.left_origin, unit.right_origin].into_iter().flatten() {
                    if self.index.contains_key(&reference) {
                        continue;
                    }
                    if self.state.contains(reference) {
                        return Readiness::Malformed(reference);
                    }
                    return Readiness::Blocked;
                }
            }
            Operation::Delete { target, .. } => {
                if !self.index.contains_key(target) && self.state.contains(*target) {
                    return Readiness::Malformed(*target);
                }
            }
        }
        Readiness::Ready
    }

    fn integrate(&mut self, op: Operation, changes: &mut Vec<ContentChange>) {
        let id = op.id();
        match &op {
            Operation::Insert(unit) => self.integrate_insert(unit.clone(), changes),
            Operation::Delete { target, .. } => self.integrate_delete(*target, changes),
        }
        self.state.advance(id.origin, id.clock);
        self.history.push(op);
    }

    /// YATA placement between the unit's left and right origins.
    fn integrate_insert(&mut self, mut unit: ContentUnit, changes: &mut Vec<ContentChange>) {
        let start = unit
            .left_origin
            .and_then(|l| self.locate(l))
            .map_or(0, |p| p + 1);
        let end = unit
            .right_origin
            .and_then(|r| self.locate(r))
            .unwrap_or(self.order.len());

        let mut dest = start;
        let mut scanned: HashSet<UnitId> = HashSet::new();
        let mut conflicting: HashSet<UnitId> = HashSet::new();

        let span = end.saturating_sub(start);
        for (offset, arena) in self.order.iter_from(start).take(span).enumerate() {
            let other = &self.units[arena as usize];
            scanned.insert(other.id);
            conflicting.insert(other.id);

            if other.left_origin == unit.left_origin {
                if other.id.origin < unit.id.origin {
                    dest = start + offset + 1;
                    conflicting.clear();
                } else if other.right_origin == unit.right_origin {
                    break;
                }
            } else if let Some(other_left) = other.left_origin.filter(|l| scanned.contains(l)) {
                if !conflicting.contains(&other_left) {
                    dest = start + offset + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        if self.orphan_deletes.remove(&unit.id) {
            unit.deleted = true;
        }
        let visible_index = self.order.visible_before(dest);
        if !unit.deleted {
            changes.push(ContentChange::Inserted { index: visible_index, value: unit.value.clone() });
        }

        let arena = self.units.len() as u32;
        self.index.insert(unit.id, arena);
        self.order.insert(dest, arena, !unit.deleted);
        self.units.push(unit);
    }

    fn integrate_delete(&mut self, target: UnitId, changes: &mut Vec<ContentChange>) {
        let Some(&arena) = self.index.get(&target) else {
            self.orphan_deletes.insert(target);
            return;
        };
        if self.units[arena as usize].deleted {
            return;
        }
        let index = self
            .locate(target)
            .map_or(0, |pos| self.order.visible_before(pos));
        self.order.hide(arena);
        let unit = &mut self.units[arena as usize];
        unit.deleted = true;
        changes.push(ContentChange::Deleted { index, value: unit.value.clone() });
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// Position of `id` in document order (tombstones included).
    fn locate(&self, id: UnitId) -> Option<usize> {
        self.order.position(*self.index.get(&id)?)
    }

    fn visible_units(&self) -> impl Iterator<Item = &ContentUnit> + '_ {
        self.order
            .iter()
            .map(|a| &self.units[a as usize])
            .filter(|u| !u.deleted)
    }

    /// Id of the unit at visible position `pos`.
    pub fn unit_at(&self, pos: usize) -> Result<UnitId, CrdtError> {
        self.order
            .nth_visible(pos)
            .map(|(_, a)| self.units[a as usize].id)
            .ok_or(CrdtError::OutOfBounds { pos, len: self.len() })
    }

    /// Visible position of `id`, `None` if unknown or deleted.
    pub fn position_of(&self, id: UnitId) -> Option<usize> {
        let arena = *self.index.get(&id)?;
        if self.units[arena as usize].deleted {
            return None;
        }
        let pos = self.order.position(arena)?;
        Some(self.order.visible_before(pos))
    }

    /// Whether `id` exists and is tombstoned.
    pub fn is_deleted(&self, id: UnitId) -> bool {
        self.index
            .get(&id)
            .is_some_and(|&a| self.units[a as usize].deleted)
    }

    /// Visible values in document order.
    pub fn content(&self) -> Vec<UnitValue> {
        self.visible_units().map(|u| u.value.clone()).collect()
    }

    /// Visible content rendered as a string.
    pub fn text(&self) -> String {
        self.visible_units().map(|u| u.value.to_string()).collect()
    }

    /// Number of visible units.
    pub fn len(&self) -> usize {
        self.order.visible_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Units ever integrated, tombstones included.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn origin(&self) -> ClientId {
        self.origin
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_limit(&self) -> usize {
        self.pending_limit
    }

    /// Operations the pending buffer is waiting for.
    pub fn missing_dependencies(&self) -> Vec<UnitId> {
        let mut missing = BTreeSet::new();
        for op in &self.pending {
            let id = op.id();
            let seen = self.state.get(id.origin);
            if id.clock > seen + 1 {
                missing.insert(UnitId::new(id.origin, seen + 1));
            }
            if let Operation::Insert(unit) = op {
                for reference in [unit.left_origin, unit.right_origin].into_iter().flatten() {
                    if !self.index.contains_key(&reference) {
                        missing.insert(reference);
                    }
                }
            }
        }
        missing.retain(|id| !self.pending_ids.contains(id));
        missing.into_iter().collect()
    }

    /// Drop every buffered operation. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.pending_ids.clear();
        dropped
    }
}

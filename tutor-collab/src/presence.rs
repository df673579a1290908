//! Presence service: who is in the room and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::set_local(patch)
//!       │
//!       ▼
//! AwarenessMessage::Update { peer_id, timestamp, patch }
//!       │
//!       ▼   (AWARENESS frame, relayed to every other member)
//! Remote PresenceRoom::handle_message()
//!       │   per-field last-writer-wins on (timestamp, peer_id)
//!       ▼
//! PresenceEvent::Changed / Removed  ──► EditorView
//! ```
//!
//! State is ephemeral: nothing here is persisted. Peers that stop sending
//! (heartbeats included) for longer than `PresenceConfig::timeout` are
//! dropped by `sweep`.
//!
//! Reference: Kleppmann, Chapter 8 (Broadcast Protocols)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Presence identity of a participant.
pub type PeerId = u64;

/// Peer id the relay uses for its own presence room. Never announced.
pub const RELAY_PEER_ID: PeerId = 0;

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Silence after which a peer is removed.
    pub timeout: Duration,
    /// How often the local peer announces it is still there.
    pub heartbeat_interval: Duration,
    /// How often timed-out peers are swept.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            timeout: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Fields and patches
// ───────────────────────────────────────────────────────────────────

/// Presence fields of one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessFields {
    pub display_name: String,
    /// Opaque color string, e.g. `#3b82f6`.
    pub color: String,
    /// Visible position of the caret.
    pub cursor_pos: Option<u64>,
    /// Half-open visible range.
    pub selection_range: Option<(u64, u64)>,
}

impl AwarenessFields {
    fn apply(&mut self, value: &FieldValue) {
        match value {
            FieldValue::DisplayName(v) => self.display_name = v.clone(),
            FieldValue::Color(v) => self.color = v.clone(),
            FieldValue::CursorPos(v) => self.cursor_pos = *v,
            FieldValue::SelectionRange(v) => self.selection_range = *v,
        }
    }
}

/// New value for a single presence field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    DisplayName(String),
    Color(String),
    CursorPos(Option<u64>),
    SelectionRange(Option<(u64, u64)>),
}

impl FieldValue {
    fn slot(&self) -> usize {
        match self {
            FieldValue::DisplayName(_) => 0,
            FieldValue::Color(_) => 1,
            FieldValue::CursorPos(_) => 2,
            FieldValue::SelectionRange(_) => 3,
        }
    }
}

const FIELD_COUNT: usize = 4;

/// A set of field changes, built fluently.
///
/// ```ignore
/// let patch = AwarenessPatch::new().cursor_pos(12).clear_selection();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessPatch(Vec<FieldValue>);

impl AwarenessPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that sets every field to the values in `fields`.
    pub fn full(fields: &AwarenessFields) -> Self {
        Self(vec![
            FieldValue::DisplayName(fields.display_name.clone()),
            FieldValue::Color(fields.color.clone()),
            FieldValue::CursorPos(fields.cursor_pos),
            FieldValue::SelectionRange(fields.selection_range),
        ])
    }

    pub fn display_name(self, name: impl Into<String>) -> Self {
        self.with(FieldValue::DisplayName(name.into()))
    }

    pub fn color(self, color: impl Into<String>) -> Self {
        self.with(FieldValue::Color(color.into()))
    }

    pub fn cursor_pos(self, pos: u64) -> Self {
        self.with(FieldValue::CursorPos(Some(pos)))
    }

    pub fn clear_cursor(self) -> Self {
        self.with(FieldValue::CursorPos(None))
    }

    pub fn selection(self, start: u64, end: u64) -> Self {
        self.with(FieldValue::SelectionRange(Some((start, end))))
    }

    pub fn clear_selection(self) -> Self {
        self.with(FieldValue::SelectionRange(None))
    }

    /// Add `value`, replacing an earlier value for the same field.
    pub fn with(mut self, value: FieldValue) -> Self {
        self.0.retain(|v| v.slot() != value.slot());
        self.0.push(value);
        self
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Presence message carried in an AWARENESS frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Field changes stamped with the author's clock.
    Update {
        peer_id: PeerId,
        timestamp: u64,
        patch: AwarenessPatch,
    },
    /// Liveness only.
    Heartbeat { peer_id: PeerId },
    /// Explicit leave. `timestamp` is the last stamp the sender knew for the peer.
    Remove { peer_id: PeerId, timestamp: u64 },
}

impl AwarenessMessage {
    pub fn peer_id(&self) -> PeerId {
        match self {
            AwarenessMessage::Update { peer_id, .. }
            | AwarenessMessage::Heartbeat { peer_id }
            | AwarenessMessage::Remove { peer_id, .. } => *peer_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Peer state
// ───────────────────────────────────────────────────────────────────

/// Last-writer-wins stamp. Ordered by timestamp, then peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Stamp {
    timestamp: u64,
    peer_id: PeerId,
}

/// A remote peer as the UI sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub peer_id: PeerId,
    pub fields: AwarenessFields,
    pub last_seen_at: Instant,
}

/// Observable presence change.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Changed(PeerPresence),
    Removed(PeerId),
}

#[derive(Debug, Clone)]
struct PeerEntry {
    presence: PeerPresence,
    stamps: [Option<Stamp>; FIELD_COUNT],
}

impl PeerEntry {
    fn latest_timestamp(&self) -> u64 {
        self.stamps
            .iter()
            .flatten()
            .map(|s| s.timestamp)
            .max()
            .unwrap_or(0)
    }

    /// Known field values grouped by the stamp each one was written with,
    /// oldest first. A peer with no stamped field still gets one message.
    fn snapshot(&self) -> Vec<AwarenessMessage> {
        let mut by_time: BTreeMap<u64, AwarenessPatch> = BTreeMap::new();
        for value in AwarenessPatch::full(&self.presence.fields).fields() {
            if let Some(stamp) = self.stamps[value.slot()] {
                let patch = by_time.entry(stamp.timestamp).or_default();
                *patch = std::mem::take(patch).with(value.clone());
            }
        }
        if by_time.is_empty() {
            by_time.insert(0, AwarenessPatch::new());
        }
        by_time
            .into_iter()
            .map(|(timestamp, patch)| AwarenessMessage::Update {
                peer_id: self.presence.peer_id,
                timestamp,
                patch,
            })
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence state of one room as seen by one participant.
pub struct PresenceRoom {
    local_peer_id: PeerId,
    local_fields: AwarenessFields,
    peers: HashMap<PeerId, PeerEntry>,
    /// Last stamp of peers that left; older updates must not resurrect them.
    departed: HashMap<PeerId, u64>,
    last_timestamp: u64,
    config: PresenceConfig,
}

impl PresenceRoom {
    pub fn new(local_peer_id: PeerId, config: PresenceConfig) -> Self {
        Self {
            local_peer_id,
            local_fields: AwarenessFields::default(),
            peers: HashMap::new(),
            departed: HashMap::new(),
            last_timestamp: 0,
            config,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn local_fields(&self) -> &AwarenessFields {
        &self.local_fields
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Wall-clock milliseconds, forced strictly increasing.
    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    // ─── Local state ─────────────────────────────────────────────

    /// Apply `patch` to the local state and return the message to broadcast.
    pub fn set_local(&mut self, patch: AwarenessPatch) -> AwarenessMessage {
        for value in patch.fields() {
            self.local_fields.apply(value);
        }
        AwarenessMessage::Update {
            peer_id: self.local_peer_id,
            timestamp: self.next_timestamp(),
            patch,
        }
    }

    /// The whole local state as one message.
    pub fn local_state_message(&mut self) -> AwarenessMessage {
        AwarenessMessage::Update {
            peer_id: self.local_peer_id,
            timestamp: self.next_timestamp(),
            patch: AwarenessPatch::full(&self.local_fields),
        }
    }

    pub fn heartbeat_message(&self) -> AwarenessMessage {
        AwarenessMessage::Heartbeat { peer_id: self.local_peer_id }
    }

    pub fn leave_message(&mut self) -> AwarenessMessage {
        AwarenessMessage::Remove {
            peer_id: self.local_peer_id,
            timestamp: self.next_timestamp(),
        }
    }

    // ─── Remote state ────────────────────────────────────────────

    /// Dispatch a wire message. Messages about the local peer are ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> Option<PresenceEvent> {
        if msg.peer_id() == self.local_peer_id {
            return None;
        }
        match msg {
            AwarenessMessage::Update { peer_id, timestamp, patch } => {
                self.on_remote_change(*peer_id, patch, *timestamp)
            }
            AwarenessMessage::Heartbeat { peer_id } => {
                self.heartbeat(*peer_id);
                None
            }
            AwarenessMessage::Remove { peer_id, timestamp } => self.remove(*peer_id, *timestamp),
        }
    }

    /// Merge a remote patch field by field.
    ///
    /// Returns `Changed` when the peer is new or a field value changed.
    pub fn on_remote_change(
        &mut self,
        peer_id: PeerId,
        patch: &AwarenessPatch,
        timestamp: u64,
    ) -> Option<PresenceEvent> {
        if let Some(&left_at) = self.departed.get(&peer_id) {
            if timestamp <= left_at {
                return None;
            }
            self.departed.remove(&peer_id);
        }

        let now = Instant::now();
        let stamp = Stamp { timestamp, peer_id };
        let mut is_new = false;
        let entry = self.peers.entry(peer_id).or_insert_with(|| {
            is_new = true;
            PeerEntry {
                presence: PeerPresence {
                    peer_id,
                    fields: AwarenessFields::default(),
                    last_seen_at: now,
                },
                stamps: [None; FIELD_COUNT],
            }
        });
        entry.presence.last_seen_at = now;

        let mut changed = is_new;
        for value in patch.fields() {
            let slot = value.slot();
            if entry.stamps[slot].is_some_and(|existing| existing >= stamp) {
                continue;
            }
            entry.stamps[slot] = Some(stamp);
            let before = entry.presence.fields.clone();
            entry.presence.fields.apply(value);
            changed |= before != entry.presence.fields;
        }

        changed.then(|| PresenceEvent::Changed(entry.presence.clone()))
    }

    /// Refresh a peer's liveness. Returns `false` if the peer is unknown.
    pub fn heartbeat(&mut self, peer_id: PeerId) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(entry) => {
                entry.presence.last_seen_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Explicit leave.
    pub fn remove(&mut self, peer_id: PeerId, timestamp: u64) -> Option<PresenceEvent> {
        let known = self.peers.get(&peer_id).map_or(0, PeerEntry::latest_timestamp);
        let left_at = self.departed.entry(peer_id).or_insert(0);
        *left_at = (*left_at).max(timestamp).max(known);
        self.peers
            .remove(&peer_id)
            .map(|_| PresenceEvent::Removed(peer_id))
    }

    /// Remove `peer_id` and build the message announcing it to others.
    pub fn depart(&mut self, peer_id: PeerId) -> Option<AwarenessMessage> {
        let timestamp = self.peers.get(&peer_id)?.latest_timestamp();
        self.remove(peer_id, timestamp)?;
        Some(AwarenessMessage::Remove { peer_id, timestamp })
    }

    /// Remove every peer silent for longer than the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<PresenceEvent> {
        let timeout = self.config.timeout;
        let mut stale: Vec<(PeerId, u64)> = self
            .peers
            .values()
            .filter(|e| now.saturating_duration_since(e.presence.last_seen_at) > timeout)
            .map(|e| (e.presence.peer_id, e.latest_timestamp()))
            .collect();
        stale.sort_unstable();

        stale
            .into_iter()
            .filter_map(|(peer_id, timestamp)| self.remove(peer_id, timestamp))
            .collect()
    }

    /// Forget every remote peer without recording departures.
    ///
    /// Used when the local transport drops: the states come back through the
    /// next awareness query.
    pub fn clear_remote(&mut self) -> Vec<PresenceEvent> {
        self.departed.clear();
        let mut ids: Vec<PeerId> = self.peers.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids.into_iter().map(PresenceEvent::Removed).collect()
    }

    /// State of every known remote peer, for answering an awareness query.
    /// Each field keeps the timestamp it was written with.
    pub fn snapshot_messages(&self) -> Vec<AwarenessMessage> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| self.peers.get(id))
            .flat_map(PeerEntry::snapshot)
            .collect()
    }

    /// Remote peers ordered by id.
    pub fn peers(&self) -> Vec<PeerPresence> {
        let mut peers: Vec<PeerPresence> =
            self.peers.values().map(|e| e.presence.clone()).collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerPresence> {
        self.peers.get(&peer_id).map(|e| &e.presence)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

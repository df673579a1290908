//! Rooms on the relay: one authoritative replica per room key.
//!
//! ```text
//!  connection task ──RoomCommand──► RoomActor ──► RoomState (sans-IO)
//!  connection task ──RoomCommand──►    │              │ Outbound
//!                                      │              ▼
//!                                      ├──► BroadcastGroup ──► members
//!                                      └──► RoomStore (update log, snapshots)
//! ```
//!
//! Every room is driven by a single task, so merges, fan-out and
//! persistence for one room never race. `RoomRegistry` maps room keys to
//! the command channel of that task and spawns it on first use. An actor
//! whose room stays empty for `evict_grace` snapshots and exits.

use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::broadcast::{BroadcastGroup, DirectSender, Envelope};
use crate::crdt::{Document, StateVector, Update, UnitId, DEFAULT_PENDING_LIMIT};
use crate::error::SyncError;
use crate::presence::{
    AwarenessMessage, PeerId, PresenceConfig, PresenceEvent, PresenceRoom, RELAY_PEER_ID,
};
use crate::protocol::{Frame, RoomKey};
use crate::storage::{RoomStore, StoreError};

/// Relay-local id of one connection.
pub type MemberId = u64;

const JOIN_ATTEMPTS: usize = 3;

/// Room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How often a room with unsaved changes is snapshotted.
    pub snapshot_interval: Duration,
    /// How long an empty room stays loaded.
    pub evict_grace: Duration,
    /// Envelopes a member may lag behind before it is dropped.
    pub broadcast_capacity: usize,
    /// Pending commands per room.
    pub command_capacity: usize,
    pub max_members: usize,
    /// Blocked operations the relay replica buffers per room.
    pub pending_limit: usize,
    pub presence: PresenceConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(30),
            evict_grace: Duration::from_secs(60),
            broadcast_capacity: 256,
            command_capacity: 1024,
            max_members: 100,
            pending_limit: DEFAULT_PENDING_LIMIT,
            presence: PresenceConfig::default(),
        }
    }
}

impl RoomConfig {
    /// Short intervals so tests observe snapshots and eviction quickly.
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval: Duration::from_millis(200),
            evict_grace: Duration::from_millis(300),
            broadcast_capacity: 256,
            command_capacity: 256,
            max_members: 16,
            pending_limit: 64,
            presence: PresenceConfig::for_testing(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Room state
// ───────────────────────────────────────────────────────────────────

/// A frame the room wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    To(MemberId, Frame),
    Broadcast { except: Option<MemberId>, frame: Frame },
}

/// Result of feeding the room one event.
#[derive(Debug, Default)]
pub struct RoomOutput {
    pub outbound: Vec<Outbound>,
    /// Operations newly integrated into the replica, for the update log.
    pub applied: Option<Update>,
}

impl RoomOutput {
    fn to(&mut self, member: MemberId, frame: Frame) {
        self.outbound.push(Outbound::To(member, frame));
    }

    fn broadcast(&mut self, except: Option<MemberId>, frame: Frame) {
        self.outbound.push(Outbound::Broadcast { except, frame });
    }
}

/// The relay's replica of one room plus who is in it.
///
/// Pure state machine: callers feed it joins, frames and leaves and deliver
/// the returned `Outbound` frames themselves.
pub struct RoomState {
    key: RoomKey,
    document: Document,
    presence: PresenceRoom,
    /// Member → peer id announced through awareness, once known.
    members: HashMap<MemberId, Option<PeerId>>,
    reset_pending: bool,
    dirty: bool,
}

impl RoomState {
    pub fn new(key: RoomKey, presence: PresenceConfig) -> Self {
        Self::with_document(key, Document::with_origin(RELAY_PEER_ID), presence)
    }

    pub fn with_document(key: RoomKey, document: Document, presence: PresenceConfig) -> Self {
        Self {
            key,
            document,
            presence: PresenceRoom::new(RELAY_PEER_ID, presence),
            members: HashMap::new(),
            reset_pending: false,
            dirty: false,
        }
    }

    /// A member connected. Ask it for everything the relay lacks.
    pub fn join(&mut self, member: MemberId) -> RoomOutput {
        let mut out = RoomOutput::default();
        self.members.insert(member, None);
        out.to(member, Frame::SyncRequest(self.document.state_vector().clone()));
        if self.reset_pending {
            out.to(member, Frame::SessionReset);
        }
        out
    }

    /// Process one frame from `member`.
    pub fn handle(&mut self, member: MemberId, frame: Frame) -> RoomOutput {
        let mut out = RoomOutput::default();
        if !self.members.contains_key(&member) {
            debug!("Room {}: frame from unknown member {member} ignored", self.key);
            return out;
        }

        match frame {
            Frame::SyncRequest(remote_sv) => {
                out.to(member, Frame::SyncReply(self.document.diff(&remote_sv)));
            }
            Frame::Update(update) | Frame::SyncReply(update) => {
                self.apply_update(member, update, &mut out);
            }
            Frame::Awareness(msg) => self.apply_awareness(member, msg, &mut out),
            Frame::AwarenessQuery => {
                let own = self.members.get(&member).copied().flatten();
                for msg in self.presence.snapshot_messages() {
                    if Some(msg.peer_id()) != own {
                        out.to(member, Frame::Awareness(msg));
                    }
                }
            }
            other => {
                debug!(
                    "Room {}: ignoring {:?} from member {member}",
                    self.key,
                    other.message_type()
                );
            }
        }
        out
    }

    fn apply_update(&mut self, member: MemberId, update: Update, out: &mut RoomOutput) {
        let merged = self.document.merge_update(&update);
        let fresh = merged.integrated;
        trace!(
            "Room {}: member {member} sent {} ops, {} new, {} visible changes",
            self.key,
            update.len(),
            fresh.len(),
            merged.changes.len()
        );

        if merged.refused > 0 {
            // buffered ops are re-sent by their authors through the sync exchange
            let dropped = self.document.discard_pending();
            warn!(
                "Room {}: member {member} overflowed the pending buffer, dropped {} ops",
                self.key,
                dropped + merged.refused
            );
            out.to(member, Frame::SyncRequest(self.document.state_vector().clone()));
        }

        if !fresh.is_empty() {
            out.broadcast(Some(member), Frame::Update(fresh.clone()));

            // operations this update unblocked that the sender never had
            let sent: HashSet<UnitId> = update.op_ids().collect();
            let unblocked = fresh.clone().without(&sent);
            if !unblocked.is_empty() {
                out.to(member, Frame::Update(unblocked));
            }
            if self.reset_pending {
                info!("Room {}: rebuilt from member {member}'s replica", self.key);
                self.reset_pending = false;
            }
            self.dirty = true;
            out.applied = Some(fresh);
        }
        out.to(member, Frame::SyncAck(self.document.state_vector().clone()));
    }

    fn apply_awareness(&mut self, member: MemberId, msg: AwarenessMessage, out: &mut RoomOutput) {
        let peer = msg.peer_id();
        if peer == RELAY_PEER_ID {
            return;
        }
        self.members.insert(member, Some(peer));

        match &msg {
            AwarenessMessage::Heartbeat { .. } => {
                if self.presence.heartbeat(peer) {
                    out.broadcast(Some(member), Frame::Awareness(msg));
                } else {
                    // state was swept; have the peer announce itself again
                    out.to(member, Frame::AwarenessQuery);
                }
            }
            AwarenessMessage::Update { .. } | AwarenessMessage::Remove { .. } => {
                if self.presence.handle_message(&msg).is_some() {
                    out.broadcast(Some(member), Frame::Awareness(msg));
                }
            }
        }
    }

    /// A member disconnected.
    pub fn leave(&mut self, member: MemberId) -> RoomOutput {
        let mut out = RoomOutput::default();
        let Some(peer) = self.members.remove(&member).flatten() else {
            return out;
        };
        let still_connected = self.members.values().any(|p| *p == Some(peer));
        if !still_connected {
            if let Some(msg) = self.presence.depart(peer) {
                out.broadcast(None, Frame::Awareness(msg));
            }
        }
        out
    }

    /// Drop peers that stopped heartbeating.
    pub fn sweep(&mut self, now: Instant) -> RoomOutput {
        let mut out = RoomOutput::default();
        for event in self.presence.sweep(now) {
            if let PresenceEvent::Removed(peer_id) = event {
                debug!("Room {}: peer {peer_id:x} timed out", self.key);
                out.broadcast(
                    None,
                    Frame::Awareness(AwarenessMessage::Remove { peer_id, timestamp: 0 }),
                );
            }
        }
        out
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn state_vector(&self) -> &StateVector {
        self.document.state_vector()
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn snapshot(&self) -> Update {
        self.document.snapshot()
    }

    /// Unsaved changes since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Members joining from now on are told the stored replica was lost.
    pub fn set_reset_pending(&mut self, pending: bool) {
        self.reset_pending = pending;
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

/// Messages from connection tasks to a room actor.
#[derive(Debug)]
pub enum RoomCommand {
    /// `reply` receives the room receiver, or `None` if the room is full.
    Join {
        member: MemberId,
        direct: DirectSender,
        reply: oneshot::Sender<Option<broadcast::Receiver<Envelope>>>,
    },
    Frame { member: MemberId, frame: Frame },
    Leave { member: MemberId },
}

/// Address of a running room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    key: RoomKey,
    generation: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Forward a frame. `false` once the actor is gone.
    pub async fn send_frame(&self, member: MemberId, frame: Frame) -> bool {
        self.tx.send(RoomCommand::Frame { member, frame }).await.is_ok()
    }

    pub async fn leave(&self, member: MemberId) {
        if self.tx.send(RoomCommand::Leave { member }).await.is_err() {
            trace!("Room {} already stopped", self.key);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Counters shared by every room actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub rooms_created: u64,
    pub rooms_evicted: u64,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
    pub persistence_errors: u64,
}

type RoomMap = Arc<RwLock<HashMap<RoomKey, RoomHandle>>>;

struct RoomActor {
    state: RoomState,
    group: BroadcastGroup,
    generation: u64,
    config: RoomConfig,
    store: Option<Arc<RoomStore>>,
    rooms: RoomMap,
    stats: Arc<RwLock<RoomStats>>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let key = self.state.key().clone();
        info!("Room {key} started");

        let snapshot_every = self.config.snapshot_interval;
        let mut snapshot_tick = interval_at(Instant::now() + snapshot_every, snapshot_every);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_every = self.config.presence.sweep_interval;
        let mut sweep_tick = interval_at(Instant::now() + sweep_every, sweep_every);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut idle_since = Some(Instant::now());

        loop {
            let evict_at = idle_since.map(|t| t + self.config.evict_grace);

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = snapshot_tick.tick() => self.persist_snapshot().await,
                _ = sweep_tick.tick() => {
                    let out = self.state.sweep(Instant::now());
                    self.deliver(out);
                }
                _ = sleep_until(evict_at.unwrap_or_else(Instant::now)), if evict_at.is_some() => {
                    if self.try_evict(&rx).await {
                        rx.close();
                        // joins that raced the eviction see their reply dropped and retry
                        while rx.try_recv().is_ok() {}
                        break;
                    }
                    idle_since = Some(Instant::now());
                }
            }

            if self.state.member_count() == 0 {
                idle_since.get_or_insert_with(Instant::now);
            } else {
                idle_since = None;
            }
        }

        self.persist_snapshot().await;
        info!("Room {key} stopped");
    }

    async fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { member, direct, reply } => {
                if self.state.member_count() >= self.config.max_members {
                    warn!("Room {} full, rejecting member {member}", self.state.key());
                    let _ = reply.send(None);
                    return;
                }
                let receiver = self.group.add_member(member, direct);
                if reply.send(Some(receiver)).is_err() {
                    // the connection gave up while waiting
                    self.group.remove_member(member);
                    return;
                }
                debug!("Room {}: member {member} joined", self.state.key());
                let out = self.state.join(member);
                self.deliver(out);
            }
            RoomCommand::Frame { member, frame } => {
                let mut out = self.state.handle(member, frame);
                // logged before the ack goes out
                if let Some(update) = out.applied.take() {
                    self.persist_update(&update).await;
                }
                self.deliver(out);
            }
            RoomCommand::Leave { member } => {
                self.group.remove_member(member);
                let out = self.state.leave(member);
                self.deliver(out);
                debug!(
                    "Room {}: member {member} left, {} remaining",
                    self.state.key(),
                    self.state.member_count()
                );
                if self.state.member_count() == 0 {
                    self.persist_snapshot().await;
                }
            }
        }
    }

    /// Encode each frame once and hand it to the group.
    fn deliver(&mut self, out: RoomOutput) {
        for outbound in out.outbound {
            match outbound {
                Outbound::To(member, frame) => match frame.encode() {
                    Ok(bytes) => {
                        if !self.group.send_to(member, Arc::new(bytes)) {
                            trace!("Member {member} gone before delivery");
                        }
                    }
                    Err(e) => error!("Room {}: failed to encode reply: {e}", self.state.key()),
                },
                Outbound::Broadcast { except, frame } => match frame.encode() {
                    Ok(bytes) => {
                        self.group.broadcast(except, Arc::new(bytes));
                    }
                    Err(e) => error!("Room {}: failed to encode broadcast: {e}", self.state.key()),
                },
            }
        }
    }

    async fn persist_update(&mut self, update: &Update) {
        let Some(store) = &self.store else { return };
        match store.append_update(self.state.key(), update) {
            Ok(_) => self.stats.write().await.persisted_updates += 1,
            Err(e) => {
                error!("Room {}: failed to log update: {e}", self.state.key());
                self.stats.write().await.persistence_errors += 1;
            }
        }
    }

    async fn persist_snapshot(&mut self) {
        if !self.state.is_dirty() && !self.state.reset_pending() {
            return;
        }
        let Some(store) = &self.store else {
            self.state.mark_clean();
            return;
        };
        match store.save_snapshot(self.state.key(), &self.state.snapshot()) {
            Ok(meta) => {
                debug!(
                    "Room {} snapshotted ({} → {} bytes)",
                    self.state.key(),
                    meta.snapshot_size,
                    meta.compressed_size
                );
                self.state.mark_clean();
                self.state.set_reset_pending(false);
                self.stats.write().await.persisted_snapshots += 1;
            }
            Err(e) => {
                error!("Room {}: snapshot failed: {e}", self.state.key());
                self.stats.write().await.persistence_errors += 1;
            }
        }
    }

    /// Unregister the room if it is still empty and idle.
    async fn try_evict(&self, rx: &mpsc::Receiver<RoomCommand>) -> bool {
        if self.state.member_count() > 0 {
            return false;
        }
        let mut rooms = self.rooms.write().await;
        if !rx.is_empty() {
            return false;
        }
        let key = self.state.key();
        if rooms.get(key).is_some_and(|h| h.generation == self.generation) {
            rooms.remove(key);
        }
        drop(rooms);
        self.stats.write().await.rooms_evicted += 1;
        info!("Room {key} evicted after idle grace");
        true
    }
}

/// Rebuild a room from its snapshot and logged updates.
fn load_document(
    store: &RoomStore,
    key: &RoomKey,
    pending_limit: usize,
) -> Result<Option<Document>, StoreError> {
    let snapshot = store.load_snapshot(key)?;
    let updates = store.load_updates(key)?;
    if snapshot.is_none() && updates.is_empty() {
        return Ok(None);
    }

    let mut document = Document::with_origin(RELAY_PEER_ID).with_pending_limit(pending_limit);
    if let Some(snapshot) = snapshot {
        document.merge(&snapshot);
    }
    for update in &updates {
        document.merge(update);
    }
    Ok(Some(document))
}

fn load_room(key: &RoomKey, store: Option<&RoomStore>, config: &RoomConfig) -> RoomState {
    let presence = config.presence.clone();
    let empty = || Document::with_origin(RELAY_PEER_ID).with_pending_limit(config.pending_limit);
    let Some(store) = store else {
        return RoomState::with_document(key.clone(), empty(), presence);
    };
    match load_document(store, key, config.pending_limit) {
        Ok(Some(document)) => {
            info!("Room {key} restored ({} chars)", document.len());
            RoomState::with_document(key.clone(), document, presence)
        }
        Ok(None) => RoomState::with_document(key.clone(), empty(), presence),
        Err(StoreError::Corrupt(reason)) => {
            let err = SyncError::Divergence(format!("stored state of room {key} is corrupt: {reason}"));
            error!("Data loss: {err}; starting empty");
            if let Err(e) = store.discard_room(key) {
                error!("Failed to discard corrupt room {key}: {e}");
            }
            let mut state = RoomState::with_document(key.clone(), empty(), presence);
            state.set_reset_pending(true);
            state
        }
        Err(e) => {
            error!("Failed to load room {key}: {e}; starting empty");
            RoomState::with_document(key.clone(), empty(), presence)
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room {0} is full")]
    Full(RoomKey),
    #[error("room {0} is unavailable")]
    Unavailable(RoomKey),
}

/// A successful join: where to send frames and where room traffic arrives.
pub struct Membership {
    pub handle: RoomHandle,
    pub receiver: broadcast::Receiver<Envelope>,
}

/// Maps room keys to running room actors.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: RoomMap,
    next_generation: Arc<AtomicU64>,
    config: RoomConfig,
    store: Option<Arc<RoomStore>>,
    stats: Arc<RwLock<RoomStats>>,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig, store: Option<Arc<RoomStore>>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
            config,
            store,
            stats: Arc::new(RwLock::new(RoomStats::default())),
        }
    }

    /// Handle of the room actor for `key`, spawning it if needed.
    pub async fn get_or_create(&self, key: &RoomKey) -> RoomHandle {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(key) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        // Slow path: write lock + double-check
        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(key) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let handle = self.spawn_room(key.clone());
        rooms.insert(key.clone(), handle.clone());
        handle
    }

    fn spawn_room(&self, key: RoomKey) -> RoomHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.command_capacity.max(1));
        let handle = RoomHandle { key: key.clone(), generation, tx };

        let config = self.config.clone();
        let store = self.store.clone();
        let rooms = self.rooms.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            stats.write().await.rooms_created += 1;
            let state = load_room(&key, store.as_deref(), &config);
            let actor = RoomActor {
                state,
                group: BroadcastGroup::new(config.broadcast_capacity),
                generation,
                config,
                store,
                rooms,
                stats,
            };
            actor.run(rx).await;
        });

        handle
    }

    /// Join `member` to the room for `key`.
    pub async fn join(
        &self,
        key: &RoomKey,
        member: MemberId,
        direct: DirectSender,
    ) -> Result<Membership, RoomError> {
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.get_or_create(key).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = RoomCommand::Join { member, direct: direct.clone(), reply: reply_tx };

            if handle.tx.send(cmd).await.is_ok() {
                match reply_rx.await {
                    Ok(Some(receiver)) => return Ok(Membership { handle, receiver }),
                    Ok(None) => return Err(RoomError::Full(key.clone())),
                    Err(_) => {}
                }
            }

            debug!("Room {key} stopped during join (attempt {attempt}), retrying");
            self.remove_handle(&handle).await;
        }
        Err(RoomError::Unavailable(key.clone()))
    }

    async fn remove_handle(&self, handle: &RoomHandle) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&handle.key).is_some_and(|h| h.generation == handle.generation) {
            rooms.remove(&handle.key);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomKey> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> RoomStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

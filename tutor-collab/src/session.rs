//! Client sync session: the protocol state machine, without I/O.
//!
//! ```text
//!              on_transport_open                 SYNC_REQUEST + SYNC_REPLY
//! Connecting ──────────────────► ExchangingState ─────────────────────────► Synced
//!     ▲                                │                                      │
//!     │ begin_connect                  └──────────── on_transport_closed ─────┤
//!     │                                                                       ▼
//!     └──────────────────────────────────────────────────────────────── Disconnected
//! ```
//!
//! Every local edit is applied to the replica immediately and kept in the
//! unacknowledged queue until the relay's state vector (from SYNC_ACK or
//! its SYNC_REQUEST) covers it. After a reconnect the queued updates are
//! replayed verbatim, so edits made offline are never re-created or lost.
//!
//! The async driver in [`crate::client`] owns the transport and feeds
//! frames in and out of this type.

use log::{debug, error, info, trace, warn};
use std::collections::{HashSet, VecDeque};
use std::ops::Range;
use tokio::time::Instant;

use crate::crdt::{ContentChange, CrdtError, Document, StateVector, UnitId, UnitValue, Update};
use crate::error::SyncError;
use crate::presence::{
    AwarenessPatch, PeerId, PeerPresence, PresenceConfig, PresenceEvent, PresenceRoom,
};
use crate::protocol::Frame;

/// Internal protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    ExchangingState,
    Synced,
    Disconnected,
}

/// Status indicator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Synced,
    Disconnected,
}

impl From<SessionState> for ConnectionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connecting | SessionState::ExchangingState => Self::Connecting,
            SessionState::Synced => Self::Synced,
            SessionState::Disconnected => Self::Disconnected,
        }
    }
}

/// Events for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    /// Remote edits changed the visible content.
    RemoteChange(Vec<ContentChange>),
    Presence(PresenceEvent),
    /// Buffered state was discarded to recover from divergence. Emitted once.
    SessionReset,
    /// Local edits are refused until the queue drains.
    ManualReconnectRequired { queued: usize },
    /// Automatic reconnection gave up.
    ReconnectFailed { attempts: u32 },
}

/// Frames to send and events to report after a session step.
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub frames: Vec<Frame>,
    pub events: Vec<SessionEvent>,
}

impl SessionOutput {
    fn frame(frame: Frame) -> Self {
        Self { frames: vec![frame], events: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.events.is_empty()
    }

    pub fn extend(&mut self, other: SessionOutput) {
        self.frames.extend(other.frames);
        self.events.extend(other.events);
    }
}

// ───────────────────────────────────────────────────────────────────
// Unacknowledged queue
// ───────────────────────────────────────────────────────────────────

/// Local updates not yet confirmed by the relay.
///
/// Bounded: when full, new edits are refused rather than evicting old ones.
pub struct UnackedQueue {
    queue: VecDeque<Update>,
    max_size: usize,
}

impl UnackedQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns `false` if the queue is full.
    pub fn enqueue(&mut self, update: Update) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Drop every update the relay's vector covers.
    pub fn prune(&mut self, acked: &StateVector) -> usize {
        let before = self.queue.len();
        self.queue.retain(|u| !u.covered_by(acked));
        before - self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Update> + '_ {
        self.queue.iter()
    }

    pub fn op_ids(&self) -> HashSet<UnitId> {
        self.queue.iter().flat_map(Update::op_ids).collect()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// One participant's view of a room.
pub struct SyncSession {
    document: Document,
    presence: PresenceRoom,
    unacked: UnackedQueue,
    state: SessionState,
    /// The relay's SYNC_REQUEST was answered on this connection.
    got_request: bool,
    got_reply: bool,
    remote_sv: StateVector,
    /// Cleared again once a handshake completes, so a later divergence is reported too.
    reset_notified: bool,
}

impl SyncSession {
    /// Session over `document`; presence uses the document's origin as peer id.
    pub fn new(document: Document, presence: PresenceConfig, max_unacked: usize) -> Self {
        let peer_id = document.origin();
        Self {
            document,
            presence: PresenceRoom::new(peer_id, presence),
            unacked: UnackedQueue::new(max_unacked),
            state: SessionState::Disconnected,
            got_request: false,
            got_reply: false,
            remote_sv: StateVector::new(),
            reset_notified: false,
        }
    }

    fn set_state(&mut self, next: SessionState, events: &mut Vec<SessionEvent>) {
        let before = ConnectionStatus::from(self.state);
        self.state = next;
        let after = ConnectionStatus::from(next);
        if before != after {
            info!("Session {:x}: {before:?} → {after:?}", self.peer_id());
            events.push(SessionEvent::StatusChanged(after));
        }
    }

    fn transport_open(&self) -> bool {
        matches!(self.state, SessionState::ExchangingState | SessionState::Synced)
    }

    // ─── Transport lifecycle ─────────────────────────────────────

    /// A connection attempt started.
    pub fn begin_connect(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.set_state(SessionState::Connecting, &mut events);
        events
    }

    /// The transport is up: start the handshake.
    pub fn on_transport_open(&mut self) -> SessionOutput {
        let mut out = SessionOutput::default();
        self.got_request = false;
        self.got_reply = false;
        self.set_state(SessionState::ExchangingState, &mut out.events);

        out.frames.push(Frame::SyncRequest(self.document.state_vector().clone()));
        out.frames.push(Frame::Awareness(self.presence.local_state_message()));
        out.frames.push(Frame::AwarenessQuery);
        out
    }

    /// The transport dropped. Queued updates are kept for the next connection.
    pub fn on_transport_closed(&mut self) -> SessionOutput {
        let mut out = SessionOutput::default();
        self.got_request = false;
        self.got_reply = false;
        self.set_state(SessionState::Disconnected, &mut out.events);
        out.events.extend(
            self.presence
                .clear_remote()
                .into_iter()
                .map(SessionEvent::Presence),
        );
        if !self.unacked.is_empty() {
            debug!("Keeping {} unacknowledged updates for replay", self.unacked.len());
        }
        out
    }

    // ─── Incoming frames ─────────────────────────────────────────

    pub fn handle_frame(&mut self, frame: Frame) -> SessionOutput {
        trace!("Session {:x} <- {:?}", self.peer_id(), frame.message_type());
        let mut out = SessionOutput::default();

        match frame {
            Frame::SyncRequest(remote_sv) => {
                self.unacked.prune(&remote_sv);

                let replayed = self.unacked.op_ids();
                if !replayed.is_empty() {
                    info!("Replaying {} queued updates", self.unacked.len());
                }
                out.frames
                    .extend(self.unacked.iter().cloned().map(Frame::Update));

                let reply = self.document.diff(&remote_sv).without(&replayed);
                out.frames.push(Frame::SyncReply(reply));

                self.remote_sv = remote_sv;
                self.got_request = true;
                self.check_synced(&mut out.events);
            }
            Frame::SyncReply(update) => {
                self.merge_remote(&update, &mut out);
                self.got_reply = true;
                self.check_synced(&mut out.events);
            }
            Frame::Update(update) => self.merge_remote(&update, &mut out),
            Frame::SyncAck(acked) => {
                let released = self.unacked.prune(&acked);
                trace!("{released} updates acknowledged");
            }
            Frame::Awareness(msg) => {
                if let Some(event) = self.presence.handle_message(&msg) {
                    out.events.push(SessionEvent::Presence(event));
                }
            }
            Frame::AwarenessQuery => {
                out.frames
                    .push(Frame::Awareness(self.presence.local_state_message()));
            }
            Frame::SessionReset => {
                info!("Relay reset the room replica");
                self.notify_reset(&mut out.events);
            }
        }
        out
    }

    fn merge_remote(&mut self, update: &Update, out: &mut SessionOutput) {
        let merged = self.document.merge_update(update);
        if !merged.changes.is_empty() {
            out.events.push(SessionEvent::RemoteChange(merged.changes));
        }
        if merged.refused > 0 {
            let dropped = self.document.discard_pending();
            warn!(
                "Pending buffer overflowed, dropped {} ops; requesting a resync",
                dropped + merged.refused
            );
            if self.transport_open() {
                out.frames
                    .push(Frame::SyncRequest(self.document.state_vector().clone()));
            }
        }
    }

    fn check_synced(&mut self, events: &mut Vec<SessionEvent>) {
        if self.state != SessionState::ExchangingState || !(self.got_request && self.got_reply) {
            return;
        }

        // the relay claims these operations, yet its reply could not place them
        let missing = self.document.missing_dependencies();
        let unreachable: Vec<UnitId> = missing
            .into_iter()
            .filter(|id| self.remote_sv.contains(*id))
            .collect();
        if !unreachable.is_empty() {
            let dropped = self.document.discard_pending();
            let err = SyncError::Divergence(format!(
                "relay covers {unreachable:?} but never delivered them"
            ));
            error!("Data loss: {err}; discarded {dropped} buffered operations");
            self.notify_reset(events);
        }

        self.set_state(SessionState::Synced, events);
        self.reset_notified = false;
    }

    fn notify_reset(&mut self, events: &mut Vec<SessionEvent>) {
        if !self.reset_notified {
            self.reset_notified = true;
            events.push(SessionEvent::SessionReset);
        }
    }

    // ─── Local edits ─────────────────────────────────────────────

    fn commit_local<F>(&mut self, edit: F) -> Result<SessionOutput, SyncError>
    where
        F: FnOnce(&mut Document) -> Result<Update, CrdtError>,
    {
        if self.unacked.is_full() {
            return Err(SyncError::LocalBufferOverflow { queued: self.unacked.len() });
        }
        let update = edit(&mut self.document)?;
        if update.is_empty() {
            return Ok(SessionOutput::default());
        }

        let send_now = self.got_request && self.transport_open();
        let frame = send_now.then(|| Frame::Update(update.clone()));
        self.unacked.enqueue(update);
        Ok(frame.map(SessionOutput::frame).unwrap_or_default())
    }

    pub fn local_insert(
        &mut self,
        after: Option<UnitId>,
        value: impl Into<UnitValue>,
    ) -> Result<SessionOutput, SyncError> {
        let value = value.into();
        self.commit_local(|doc| doc.apply_local_insert(after, value))
    }

    pub fn local_delete(&mut self, unit_id: UnitId) -> Result<SessionOutput, SyncError> {
        self.commit_local(|doc| doc.apply_local_delete(unit_id))
    }

    pub fn insert_text(&mut self, pos: usize, text: &str) -> Result<SessionOutput, SyncError> {
        self.commit_local(|doc| doc.insert_text(pos, text))
    }

    pub fn insert_at(
        &mut self,
        pos: usize,
        values: Vec<UnitValue>,
    ) -> Result<SessionOutput, SyncError> {
        self.commit_local(|doc| doc.insert_at(pos, values))
    }

    pub fn delete_range(&mut self, range: Range<usize>) -> Result<SessionOutput, SyncError> {
        self.commit_local(|doc| doc.delete_range(range))
    }

    // ─── Presence ────────────────────────────────────────────────

    /// Update local presence; broadcast if connected, otherwise sent on open.
    pub fn set_presence(&mut self, patch: AwarenessPatch) -> SessionOutput {
        let msg = self.presence.set_local(patch);
        if self.transport_open() {
            SessionOutput::frame(Frame::Awareness(msg))
        } else {
            SessionOutput::default()
        }
    }

    pub fn heartbeat(&self) -> Option<Frame> {
        self.transport_open()
            .then(|| Frame::Awareness(self.presence.heartbeat_message()))
    }

    /// Drop remote peers that went silent.
    pub fn sweep(&mut self, now: Instant) -> SessionOutput {
        SessionOutput {
            frames: Vec::new(),
            events: self
                .presence
                .sweep(now)
                .into_iter()
                .map(SessionEvent::Presence)
                .collect(),
        }
    }

    /// Frame announcing that the local peer leaves.
    pub fn leave_frame(&mut self) -> Frame {
        Frame::Awareness(self.presence.leave_message())
    }

    /// Frames for a graceful close: queued updates never sent on the open
    /// transport, then the leave announcement.
    ///
    /// Once the relay's SYNC_REQUEST was answered every queued update has
    /// gone out, either replayed or sent live.
    pub fn close_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.transport_open() && !self.got_request {
            frames.extend(self.unacked.iter().cloned().map(Frame::Update));
        }
        frames.push(self.leave_frame());
        frames
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn peer_id(&self) -> PeerId {
        self.presence.local_peer_id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.into()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn peers(&self) -> Vec<PeerPresence> {
        self.presence.peers()
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{ContentUnit, Operation};
    use crate::presence::AwarenessMessage;

    fn session(origin: u64) -> SyncSession {
        SyncSession::new(Document::with_origin(origin), PresenceConfig::default(), 10_000)
    }

    fn handshake(session: &mut SyncSession, relay: &Document) -> SessionOutput {
        session.begin_connect();
        let mut out = session.on_transport_open();
        out.extend(session.handle_frame(Frame::SyncRequest(relay.state_vector().clone())));
        let sv = match &out.frames[0] {
            Frame::SyncRequest(sv) => sv.clone(),
            other => panic!("expected SyncRequest, got {other:?}"),
        };
        out.extend(session.handle_frame(Frame::SyncReply(relay.diff(&sv))));
        out
    }

    #[test]
    fn test_transport_open_frames() {
        let mut s = session(1);
        s.set_presence(AwarenessPatch::new().display_name("Ada"));
        let out = s.on_transport_open();

        assert_eq!(s.state(), SessionState::ExchangingState);
        assert!(matches!(out.frames[0], Frame::SyncRequest(_)));
        match &out.frames[1] {
            Frame::Awareness(AwarenessMessage::Update { patch, .. }) => {
                assert!(patch.fields().contains(&crate::presence::FieldValue::DisplayName("Ada".into())));
            }
            other => panic!("expected awareness, got {other:?}"),
        }
        assert_eq!(out.frames[2], Frame::AwarenessQuery);
    }

    #[test]
    fn test_handshake_reaches_synced() {
        let mut relay = Document::with_origin(99);
        relay.insert_text(0, "shared").unwrap();

        let mut s = session(1);
        let out = handshake(&mut s, &relay);

        assert_eq!(s.status(), ConnectionStatus::Synced);
        assert_eq!(s.text(), "shared");
        assert!(out
            .events
            .contains(&SessionEvent::StatusChanged(ConnectionStatus::Synced)));
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::RemoteChange(c) if c.len() == 6)));
    }

    #[test]
    fn test_offline_edits_replayed_not_duplicated() {
        let relay = Document::with_origin(99);
        let mut s = session(1);

        let out = s.insert_text(0, "ab").unwrap();
        assert!(out.frames.is_empty());
        s.insert_text(2, "c").unwrap();
        assert_eq!(s.unacked_len(), 2);

        s.begin_connect();
        s.on_transport_open();
        let out = s.handle_frame(Frame::SyncRequest(relay.state_vector().clone()));

        assert_eq!(out.frames.len(), 3);
        assert!(matches!(&out.frames[0], Frame::Update(u) if u.len() == 2));
        assert!(matches!(&out.frames[1], Frame::Update(u) if u.len() == 1));
        assert!(matches!(&out.frames[2], Frame::SyncReply(u) if u.is_empty()));
    }

    #[test]
    fn test_ack_prunes_queue() {
        let relay = Document::with_origin(99);
        let mut s = session(1);
        handshake(&mut s, &relay);

        let out = s.insert_text(0, "x").unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(s.unacked_len(), 1);

        s.handle_frame(Frame::SyncAck(s.document().state_vector().clone()));
        assert_eq!(s.unacked_len(), 0);
    }

    #[test]
    fn test_buffer_overflow_refuses_edit() {
        let mut s = SyncSession::new(Document::with_origin(1), PresenceConfig::default(), 2);
        s.insert_text(0, "a").unwrap();
        s.insert_text(1, "b").unwrap();

        let err = s.insert_text(2, "c").unwrap_err();
        assert_eq!(err, SyncError::LocalBufferOverflow { queued: 2 });
        assert_eq!(s.text(), "ab");
    }

    #[test]
    fn test_session_reset_emitted_once() {
        let mut s = session(1);
        let first = s.handle_frame(Frame::SessionReset);
        let second = s.handle_frame(Frame::SessionReset);
        assert_eq!(first.events, vec![SessionEvent::SessionReset]);
        assert!(second.events.is_empty());
    }

    #[test]
    fn test_close_flushes_updates_made_before_relay_request() {
        let mut s = session(1);
        s.begin_connect();
        s.on_transport_open();

        let out = s.insert_text(0, "early").unwrap();
        assert!(out.frames.is_empty());

        let frames = s.close_frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Update(u) if u.len() == 5));
        assert!(matches!(&frames[1], Frame::Awareness(AwarenessMessage::Remove { peer_id: 1, .. })));
    }

    #[test]
    fn test_close_does_not_resend_after_handshake() {
        let relay = Document::with_origin(99);
        let mut s = session(1);
        handshake(&mut s, &relay);
        s.insert_text(0, "sent live").unwrap();

        let frames = s.close_frames();
        assert!(matches!(&frames[..], [Frame::Awareness(AwarenessMessage::Remove { .. })]));

        // nothing can be flushed without a transport
        let mut offline = session(2);
        offline.insert_text(0, "queued").unwrap();
        assert_eq!(offline.close_frames().len(), 1);
        assert_eq!(offline.unacked_len(), 1);
    }

    #[test]
    fn test_reset_reported_again_after_resync() {
        let relay = Document::with_origin(99);
        let mut s = session(1);
        s.begin_connect();
        s.on_transport_open();
        s.handle_frame(Frame::SyncRequest(relay.state_vector().clone()));
        let first = s.handle_frame(Frame::SessionReset);
        assert_eq!(first.events, vec![SessionEvent::SessionReset]);
        s.handle_frame(Frame::SyncReply(Update::default()));
        assert_eq!(s.status(), ConnectionStatus::Synced);

        // a later, separate divergence is surfaced as well
        let second = s.handle_frame(Frame::SessionReset);
        assert_eq!(second.events, vec![SessionEvent::SessionReset]);
    }

    #[test]
    fn test_pending_overflow_requests_resync() {
        let relay = Document::with_origin(99);
        let mut s = SyncSession::new(
            Document::with_origin(1).with_pending_limit(2),
            PresenceConfig::default(),
            10_000,
        );
        handshake(&mut s, &relay);

        let gapped: Vec<Operation> = (5..9)
            .map(|clock| {
                Operation::Insert(ContentUnit {
                    id: UnitId::new(7, clock),
                    value: UnitValue::Char('x'),
                    left_origin: None,
                    right_origin: None,
                    deleted: false,
                })
            })
            .collect();
        let out = s.handle_frame(Frame::Update(Update::new(gapped)));

        assert_eq!(s.document().pending_len(), 0);
        assert_eq!(
            out.frames,
            vec![Frame::SyncRequest(s.document().state_vector().clone())]
        );
    }

    #[test]
    fn test_divergence_discards_pending() {
        let mut s = session(1);
        s.begin_connect();
        s.on_transport_open();

        // relay claims 7@1 exists but only ever sends 7@2 which depends on it
        let relay_sv: StateVector = [(7, 2)].into_iter().collect();
        s.handle_frame(Frame::SyncRequest(relay_sv));
        let orphan = Update::new(vec![Operation::Insert(ContentUnit {
            id: UnitId::new(7, 2),
            value: UnitValue::Char('z'),
            left_origin: Some(UnitId::new(7, 1)),
            right_origin: None,
            deleted: false,
        })]);
        let out = s.handle_frame(Frame::SyncReply(orphan));

        assert!(out.events.contains(&SessionEvent::SessionReset));
        assert_eq!(s.document().pending_len(), 0);
        assert_eq!(s.status(), ConnectionStatus::Synced);
    }

    #[test]
    fn test_transport_closed_clears_presence() {
        let relay = Document::with_origin(99);
        let mut s = session(1);
        handshake(&mut s, &relay);
        s.handle_frame(Frame::Awareness(AwarenessMessage::Update {
            peer_id: 5,
            timestamp: 1,
            patch: AwarenessPatch::new().cursor_pos(3),
        }));
        assert_eq!(s.peers().len(), 1);

        let out = s.on_transport_closed();
        assert_eq!(s.status(), ConnectionStatus::Disconnected);
        assert!(out.events.contains(&SessionEvent::Presence(PresenceEvent::Removed(5))));
        assert!(s.heartbeat().is_none());
    }

    #[test]
    fn test_awareness_query_answered_with_local_state() {
        let mut s = session(1);
        s.set_presence(AwarenessPatch::new().cursor_pos(2));
        let out = s.handle_frame(Frame::AwarenessQuery);
        assert!(matches!(
            &out.frames[..],
            [Frame::Awareness(AwarenessMessage::Update { peer_id: 1, .. })]
        ));
    }
}

//! Fan-out of encoded frames to the members of one room.
//!
//! Room-wide frames go through a single tokio broadcast channel: one send,
//! every subscriber gets the same `Arc` of bytes. Each envelope names the
//! member it must skip so a sender never sees its own edit echoed back.
//! Replies addressed to a single member use that member's direct channel.
//!
//! ```text
//!                ┌──────────────┐  Envelope{except, bytes}
//!  RoomActor ───►│ broadcast tx │──────────┬──────────┬──────────┐
//!       │        └──────────────┘          ▼          ▼          ▼
//!       │                              member 1   member 2   member 3
//!       └──── send_to(2, bytes) ─────────────────────►│ (direct mpsc)
//! ```
//!
//! A receiver that falls more than `capacity` envelopes behind gets
//! `RecvError::Lagged`; the connection task then drops the member so it
//! resyncs from scratch on reconnect.
//!
//! Reference: Patterson & Hennessy, Section 6.4 - Interconnection Networks

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::room::MemberId;

/// Channel for frames addressed to one member.
pub type DirectSender = mpsc::UnboundedSender<Arc<Vec<u8>>>;

/// One encoded frame on the room channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Member that must not receive this frame (the originator).
    pub except: Option<MemberId>,
    pub bytes: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether `member` should forward this envelope to its socket.
    pub fn is_for(&self, member: MemberId) -> bool {
        self.except != Some(member)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub broadcasts_sent: u64,
    pub direct_sent: u64,
    /// Direct frames whose member had already gone.
    pub direct_dropped: u64,
    pub active_members: usize,
}

/// The delivery side of a room. Owned by the room actor, so no locking.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    direct: HashMap<MemberId, DirectSender>,
    capacity: usize,
    stats: BroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many envelopes a slow member may lag behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            direct: HashMap::new(),
            capacity: capacity.max(1),
            stats: BroadcastStats::default(),
        }
    }

    /// Register a member. Returns its room-wide receiver.
    pub fn add_member(&mut self, member: MemberId, direct: DirectSender) -> broadcast::Receiver<Envelope> {
        self.direct.insert(member, direct);
        self.sender.subscribe()
    }

    pub fn remove_member(&mut self, member: MemberId) -> bool {
        self.direct.remove(&member).is_some()
    }

    /// Send `bytes` to every member except `except`.
    ///
    /// Returns the number of subscribed receivers, the skipped one included.
    pub fn broadcast(&mut self, except: Option<MemberId>, bytes: Arc<Vec<u8>>) -> usize {
        self.stats.broadcasts_sent += 1;
        self.sender.send(Envelope { except, bytes }).unwrap_or(0)
    }

    /// Send `bytes` to one member. `false` if it is gone.
    pub fn send_to(&mut self, member: MemberId, bytes: Arc<Vec<u8>>) -> bool {
        let delivered = self
            .direct
            .get(&member)
            .is_some_and(|tx| tx.send(bytes).is_ok());
        if delivered {
            self.stats.direct_sent += 1;
        } else {
            self.stats.direct_dropped += 1;
        }
        delivered
    }

    pub fn member_count(&self) -> usize {
        self.direct.len()
    }

    pub fn has_member(&self, member: MemberId) -> bool {
        self.direct.contains_key(&member)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            active_members: self.direct.len(),
            ..self.stats.clone()
        }
    }
}

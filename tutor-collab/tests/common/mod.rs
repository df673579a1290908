//! In-memory relay harness: sessions and a room wired together without
//! sockets. Every frame is encoded and decoded on the way through.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

use tutor_collab::crdt::Document;
use tutor_collab::error::SyncError;
use tutor_collab::presence::PresenceConfig;
use tutor_collab::protocol::{Frame, RoomKey};
use tutor_collab::room::{MemberId, Outbound, RoomOutput, RoomState};
use tutor_collab::session::{SessionEvent, SessionOutput, SyncSession};

pub struct Peer {
    pub session: SyncSession,
    pub connected: bool,
    pub events: Vec<SessionEvent>,
    /// Every frame delivered to this peer, in order.
    pub received: Vec<Frame>,
}

enum Hop {
    ToRoom(MemberId, Frame),
    ToPeer(MemberId, Frame),
}

pub struct Net {
    pub room: RoomState,
    peers: BTreeMap<MemberId, Peer>,
    queue: VecDeque<Hop>,
    /// Every frame delivered to the room, with its sender.
    pub room_received: Vec<(MemberId, Frame)>,
    presence: PresenceConfig,
}

fn wire(frame: &Frame) -> Frame {
    let bytes = frame.encode().expect("encode");
    Frame::decode(&bytes).expect("decode")
}

impl Net {
    pub fn new(presence: PresenceConfig) -> Self {
        Self::with_room(RoomState::new(RoomKey::code("harness"), presence.clone()), presence)
    }

    pub fn with_room(room: RoomState, presence: PresenceConfig) -> Self {
        Self {
            room,
            peers: BTreeMap::new(),
            queue: VecDeque::new(),
            room_received: Vec::new(),
            presence,
        }
    }

    /// Add a disconnected peer whose replica has `origin`.
    pub fn add_peer(&mut self, member: MemberId, origin: u64) {
        let session = SyncSession::new(Document::with_origin(origin), self.presence.clone(), 10_000);
        self.peers.insert(
            member,
            Peer { session, connected: false, events: Vec::new(), received: Vec::new() },
        );
    }

    pub fn peer(&self, member: MemberId) -> &Peer {
        &self.peers[&member]
    }

    pub fn peer_mut(&mut self, member: MemberId) -> &mut Peer {
        self.peers.get_mut(&member).expect("unknown peer")
    }

    pub fn text(&self, member: MemberId) -> String {
        self.peer(member).session.text()
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.peers.keys().copied().collect()
    }

    pub fn connect(&mut self, member: MemberId) {
        let peer = self.peer_mut(member);
        peer.connected = true;
        let events = peer.session.begin_connect();
        peer.events.extend(events);

        let out = self.room.join(member);
        self.route(out);
        let out = self.peer_mut(member).session.on_transport_open();
        self.emit(member, out);
        self.pump();
    }

    /// Transport drops without a leave message.
    pub fn disconnect(&mut self, member: MemberId) {
        let peer = self.peer_mut(member);
        peer.connected = false;
        let out = peer.session.on_transport_closed();
        peer.events.extend(out.events);

        let out = self.room.leave(member);
        self.route(out);
        self.pump();
    }

    /// Peer announces its departure, then the transport closes.
    pub fn leave(&mut self, member: MemberId) {
        let frame = self.peer_mut(member).session.leave_frame();
        self.queue.push_back(Hop::ToRoom(member, frame));
        self.pump();
        self.disconnect(member);
    }

    /// Peer stops talking while the relay still thinks it is connected.
    pub fn go_silent(&mut self, member: MemberId) {
        self.peer_mut(member).connected = false;
    }

    /// Run a local operation on a peer's session and deliver its output.
    pub fn edit<F>(&mut self, member: MemberId, f: F)
    where
        F: FnOnce(&mut SyncSession) -> Result<SessionOutput, SyncError>,
    {
        let out = f(&mut self.peer_mut(member).session).expect("local edit");
        self.emit(member, out);
        self.pump();
    }

    pub fn set_presence(&mut self, member: MemberId, patch: tutor_collab::presence::AwarenessPatch) {
        let out = self.peer_mut(member).session.set_presence(patch);
        self.emit(member, out);
        self.pump();
    }

    /// Heartbeats from every connected peer.
    pub fn heartbeats(&mut self) {
        for member in self.members() {
            let peer = self.peer(member);
            if !peer.connected {
                continue;
            }
            if let Some(frame) = peer.session.heartbeat() {
                self.queue.push_back(Hop::ToRoom(member, frame));
            }
        }
        self.pump();
    }

    /// Presence sweeps on the relay and on every connected peer.
    pub fn sweep(&mut self, now: Instant) {
        let out = self.room.sweep(now);
        self.route(out);
        for member in self.members() {
            if self.peer(member).connected {
                let out = self.peer_mut(member).session.sweep(now);
                self.emit(member, out);
            }
        }
        self.pump();
    }

    fn emit(&mut self, member: MemberId, out: SessionOutput) {
        let peer = self.peer_mut(member);
        peer.events.extend(out.events);
        if peer.connected {
            for frame in out.frames {
                self.queue.push_back(Hop::ToRoom(member, frame));
            }
        }
    }

    fn route(&mut self, out: RoomOutput) {
        for outbound in out.outbound {
            match outbound {
                Outbound::To(member, frame) => self.queue.push_back(Hop::ToPeer(member, frame)),
                Outbound::Broadcast { except, frame } => {
                    for member in self.members() {
                        if Some(member) != except {
                            self.queue.push_back(Hop::ToPeer(member, frame.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Deliver queued frames until the network is quiet.
    pub fn pump(&mut self) {
        while let Some(hop) = self.queue.pop_front() {
            match hop {
                Hop::ToRoom(member, frame) => {
                    let frame = wire(&frame);
                    self.room_received.push((member, frame.clone()));
                    let out = self.room.handle(member, frame);
                    self.route(out);
                }
                Hop::ToPeer(member, frame) => {
                    let Some(peer) = self.peers.get_mut(&member) else { continue };
                    if !peer.connected {
                        continue;
                    }
                    let frame = wire(&frame);
                    peer.received.push(frame.clone());
                    let out = peer.session.handle_frame(frame);
                    self.emit(member, out);
                }
            }
        }
    }
}

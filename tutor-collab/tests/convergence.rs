//! Convergence properties of replicas synced through the relay.

mod common;

use proptest::prelude::*;
use std::collections::HashSet;

use common::Net;
use tutor_collab::crdt::{Document, Operation, Update, UnitId};
use tutor_collab::presence::PresenceConfig;
use tutor_collab::protocol::Frame;
use tutor_collab::session::{ConnectionStatus, SessionEvent};

#[derive(Debug, Clone)]
enum Step {
    Insert { peer: usize, at: usize, text: String },
    Delete { peer: usize, at: usize, len: usize },
    /// `to` learns everything `from` has, so later edits depend on it.
    Share { from: usize, to: usize },
}

const PEERS: usize = 3;

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0..PEERS, any::<usize>(), "[a-z]{1,3}")
            .prop_map(|(peer, at, text)| Step::Insert { peer, at, text }),
        2 => (0..PEERS, any::<usize>(), 1..4usize)
            .prop_map(|(peer, at, len)| Step::Delete { peer, at, len }),
        1 => (0..PEERS, 0..PEERS).prop_map(|(from, to)| Step::Share { from, to }),
    ]
}

/// Apply `step`; returns the local update it produced, if any.
fn run_step(docs: &mut [Document], step: &Step) -> Option<Update> {
    match step {
        Step::Insert { peer, at, text } => {
            let doc = &mut docs[*peer];
            let pos = at % (doc.len() + 1);
            Some(doc.insert_text(pos, text).unwrap())
        }
        Step::Delete { peer, at, len } => {
            let doc = &mut docs[*peer];
            if doc.is_empty() {
                return None;
            }
            let start = at % doc.len();
            let end = (start + len).min(doc.len());
            Some(doc.delete_range(start..end).unwrap())
        }
        Step::Share { from, to } => {
            if from != to {
                let snapshot = docs[*from].snapshot();
                docs[*to].merge(&snapshot);
            }
            None
        }
    }
}

fn origins() -> [u64; PEERS] {
    [11, 22, 33]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge_in_any_delivery_order(
        steps in prop::collection::vec(step_strategy(), 1..40),
        order_keys in prop::collection::vec(any::<u32>(), 64),
    ) {
        let mut docs: Vec<Document> = origins().iter().map(|&o| Document::with_origin(o)).collect();
        let updates: Vec<Update> = steps.iter().filter_map(|s| run_step(&mut docs, s)).collect();

        for (r, doc) in docs.iter_mut().enumerate() {
            let mut order: Vec<usize> = (0..updates.len()).collect();
            order.sort_by_key(|i| order_keys[(i + r * 7) % order_keys.len()]);
            for i in order {
                doc.merge(&updates[i]);
            }
            prop_assert_eq!(doc.pending_len(), 0);
        }

        let text = docs[0].text();
        for doc in &docs[1..] {
            prop_assert_eq!(&doc.text(), &text);
            prop_assert_eq!(doc.state_vector(), docs[0].state_vector());
        }
    }

    #[test]
    fn merge_is_idempotent(steps in prop::collection::vec(step_strategy(), 1..30)) {
        let mut docs: Vec<Document> = origins().iter().map(|&o| Document::with_origin(o)).collect();
        let updates: Vec<Update> = steps.iter().filter_map(|s| run_step(&mut docs, s)).collect();

        let mut replica = Document::with_origin(99);
        for update in &updates {
            replica.merge(update);
        }
        let text = replica.text();
        let units = replica.unit_count();

        for update in &updates {
            prop_assert!(replica.merge(update).is_empty());
        }
        prop_assert!(replica.merge(&replica.snapshot()).is_empty());
        prop_assert_eq!(replica.text(), text);
        prop_assert_eq!(replica.unit_count(), units);
    }

    #[test]
    fn peers_converge_through_relay(
        edits in prop::collection::vec((0..PEERS, any::<usize>(), "[a-z]{1,4}"), 1..20),
        connect_order in Just((1..=PEERS as u64).collect::<Vec<u64>>()).prop_shuffle(),
    ) {
        let mut net = Net::new(PresenceConfig::default());
        for (i, origin) in origins().iter().enumerate() {
            net.add_peer(i as u64 + 1, *origin);
        }

        // everyone edits offline
        for (peer, at, text) in &edits {
            let member = *peer as u64 + 1;
            let len = net.peer(member).session.document().len();
            net.edit(member, |s| s.insert_text(at % (len + 1), text));
        }

        for member in connect_order {
            net.connect(member);
        }

        let relay_text = net.room.document().text();
        for member in net.members() {
            prop_assert_eq!(net.text(member), relay_text.clone());
            prop_assert_eq!(net.peer(member).session.unacked_len(), 0);
            prop_assert_eq!(net.peer(member).session.status(), ConnectionStatus::Synced);
        }
    }
}

#[test]
fn scenario_concurrent_inserts_at_start_agree() {
    let mut net = Net::new(PresenceConfig::default());
    net.add_peer(1, 5);
    net.add_peer(2, 9);

    net.edit(1, |s| s.insert_text(0, "Hello"));
    net.edit(2, |s| s.insert_text(0, "Hi "));
    net.connect(1);
    net.connect(2);

    let text = net.text(1);
    assert_eq!(net.text(2), text);
    assert!(text == "Hi Hello" || text == "HelloHi ", "interleaved: {text:?}");
}

#[test]
fn scenario_edit_inside_deleted_range_does_not_resurrect() {
    let mut net = Net::new(PresenceConfig::default());
    net.add_peer(1, 5);
    net.add_peer(2, 9);
    net.connect(1);
    net.connect(2);

    net.edit(1, |s| s.insert_text(0, "abcdefgh"));
    assert_eq!(net.text(2), "abcdefgh");

    net.disconnect(1);
    net.disconnect(2);

    // peer 1 removes "abcde", peer 2 replaces 'd' with 'X'
    net.edit(1, |s| s.delete_range(0..5));
    net.edit(2, |s| s.delete_range(3..4));
    net.edit(2, |s| s.insert_text(3, "X"));

    net.connect(1);
    net.connect(2);

    let text = net.text(1);
    assert_eq!(net.text(2), text);
    assert_eq!(text, "Xfgh");
    assert!(!text.contains(['a', 'b', 'c', 'd', 'e']));
}

#[test]
fn scenario_resync_delivers_exactly_the_missing_updates() {
    let mut net = Net::new(PresenceConfig::default());
    net.add_peer(1, 5);
    net.add_peer(2, 9);
    net.connect(1);
    net.connect(2);

    net.edit(1, |s| s.insert_text(0, "one "));
    net.edit(1, |s| s.insert_text(4, "two "));
    assert_eq!(net.peer(1).session.unacked_len(), 0);
    net.disconnect(1);

    let mut missed = Vec::new();
    for (pos, text) in [(0, "x"), (1, "yy"), (3, "zzz")] {
        let before = net.peer(2).session.document().state_vector().clone();
        net.edit(2, |s| s.insert_text(pos, text));
        missed.push(net.peer(2).session.document().diff(&before));
    }

    let seen_before = net.peer(1).received.len();
    net.connect(1);

    let replies: Vec<&Update> = net.peer(1).received[seen_before..]
        .iter()
        .filter_map(|f| match f {
            Frame::SyncReply(update) | Frame::Update(update) => Some(update),
            _ => None,
        })
        .filter(|u| !u.is_empty())
        .collect();
    assert_eq!(replies.len(), 1, "expected a single sync reply, got {replies:?}");

    let expected: Vec<Operation> = missed.iter().flat_map(|u| u.ops().to_vec()).collect();
    assert_eq!(replies[0].ops(), expected.as_slice());
    assert_eq!(net.text(1), net.text(2));

    // reconnecting again carries nothing new
    let seen_before = net.peer(1).received.len();
    net.disconnect(1);
    net.connect(1);
    let extra = net.peer(1).received[seen_before..]
        .iter()
        .any(|f| matches!(f, Frame::SyncReply(u) | Frame::Update(u) if !u.is_empty()));
    assert!(!extra);
}

#[test]
fn offline_updates_replayed_not_recreated() {
    let mut net = Net::new(PresenceConfig::default());
    net.add_peer(1, 5);
    net.connect(1);
    net.disconnect(1);

    net.edit(1, |s| s.insert_text(0, "a"));
    net.edit(1, |s| s.insert_text(1, "b"));
    net.edit(1, |s| s.insert_text(2, "c"));
    assert_eq!(net.peer(1).session.unacked_len(), 3);

    let seen = net.room_received.len();
    net.connect(1);

    let updates: Vec<&Update> = net.room_received[seen..]
        .iter()
        .filter_map(|(_, f)| match f {
            Frame::Update(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 3);
    assert_eq!(net.room.document().text(), "abc");
    assert_eq!(net.peer(1).session.unacked_len(), 0);
}

#[test]
fn stale_update_does_not_resurrect_tombstone() {
    let mut a = Document::with_origin(1);
    let mut b = Document::with_origin(2);

    let insert = a.insert_text(0, "abc").unwrap();
    b.merge(&insert);
    let delete = b.delete_range(1..2).unwrap();
    a.merge(&delete);
    assert_eq!(a.text(), "ac");

    // the original insert arrives again, late
    assert!(a.merge(&insert).is_empty());
    assert!(b.merge(&insert).is_empty());
    assert_eq!(a.text(), "ac");
    assert_eq!(b.text(), "ac");
}

#[test]
fn operation_ids_unique_across_replicas() {
    let mut docs: Vec<Document> = origins().iter().map(|&o| Document::with_origin(o)).collect();
    let mut ids: HashSet<UnitId> = HashSet::new();
    let mut total = 0;

    for round in 0..20 {
        for r in 0..PEERS {
            let len = docs[r].len();
            let update = if round % 3 == 2 && len > 0 {
                docs[r].delete_range(0..1).unwrap()
            } else {
                docs[r].insert_text(len / 2, "q").unwrap()
            };
            total += update.len();
            ids.extend(update.op_ids());
            for other in 0..PEERS {
                if other != r {
                    docs[other].merge(&update);
                }
            }
        }
    }
    assert_eq!(ids.len(), total);
}

#[test]
fn resync_equivalent_to_staying_connected() {
    let script = |net: &mut Net, drop_peer: bool| {
        net.add_peer(1, 5);
        net.add_peer(2, 9);
        net.connect(1);
        net.connect(2);
        net.edit(1, |s| s.insert_text(0, "shared "));
        if drop_peer {
            net.disconnect(2);
        }
        net.edit(1, |s| s.insert_text(7, "text"));
        net.edit(2, |s| s.insert_text(0, ">> "));
        if drop_peer {
            net.connect(2);
        }
    };

    let mut steady = Net::new(PresenceConfig::default());
    script(&mut steady, false);
    let mut flaky = Net::new(PresenceConfig::default());
    script(&mut flaky, true);

    assert_eq!(steady.text(1), steady.text(2));
    assert_eq!(flaky.text(1), flaky.text(2));
    assert_eq!(steady.text(1), flaky.text(1));
}

#[test]
fn divergent_relay_triggers_single_reset() {
    let mut net = Net::new(PresenceConfig::default());
    net.add_peer(1, 5);
    net.connect(1);

    // relay state vector claims origin 77 up to clock 2, but it only sends clock 2
    let mut ghost = Document::with_origin(77);
    ghost.insert_text(0, "g").unwrap();
    let second = ghost.insert_text(1, "h").unwrap();
    let peer = net.peer_mut(1);
    let mut out = peer.session.handle_frame(Frame::Update(second));
    assert_eq!(peer.session.document().pending_len(), 1);

    let mut claimed = peer.session.document().state_vector().clone();
    claimed.advance(77, 2);
    peer.session.on_transport_closed();
    peer.session.on_transport_open();
    out.extend(peer.session.handle_frame(Frame::SyncRequest(claimed)));
    out.extend(peer.session.handle_frame(Frame::SyncReply(Update::default())));

    assert_eq!(peer.session.document().pending_len(), 0);
    let resets = out.events.iter().filter(|e| **e == SessionEvent::SessionReset).count();
    assert_eq!(resets, 1);
}

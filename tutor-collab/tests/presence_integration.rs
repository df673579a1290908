//! Presence propagation: cursors, selections, departures and timeouts.

mod common;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{advance, sleep, timeout, Duration, Instant};

use common::Net;
use tutor_collab::client::{ClientConfig, SyncClient};
use tutor_collab::presence::{AwarenessPatch, PresenceConfig};
use tutor_collab::protocol::RoomKey;
use tutor_collab::server::{RelayConfig, RelayServer};
use tutor_collab::session::ConnectionStatus;

fn cursor_of(net: &Net, observer: u64, peer_id: u64) -> Option<u64> {
    net.peer(observer)
        .session
        .peers()
        .into_iter()
        .find(|p| p.peer_id == peer_id)
        .and_then(|p| p.fields.cursor_pos)
}

fn three_member_room() -> Net {
    let mut net = Net::new(PresenceConfig::default());
    for (member, origin) in [(1, 101), (2, 102), (3, 103)] {
        net.add_peer(member, origin);
        net.connect(member);
    }
    net.edit(1, |s| s.insert_text(0, "let answer = 42;"));
    net
}

#[tokio::test(start_paused = true)]
async fn test_cursor_disappears_after_silent_disconnect() {
    let mut net = three_member_room();

    net.set_presence(2, AwarenessPatch::new().display_name("bo").cursor_pos(10));
    assert_eq!(cursor_of(&net, 1, 102), Some(10));
    assert_eq!(cursor_of(&net, 3, 102), Some(10));

    // member 2 vanishes without closing its connection
    net.go_silent(2);
    let vanished_at = Instant::now();

    let mut gone_after = None;
    for second in 1..=40u64 {
        advance(Duration::from_secs(1)).await;
        if second % 10 == 0 {
            net.heartbeats();
        }
        net.sweep(Instant::now());

        let visible = cursor_of(&net, 1, 102).is_some() || cursor_of(&net, 3, 102).is_some();
        if !visible {
            gone_after = Some(Instant::now() - vanished_at);
            break;
        }
    }

    let gone_after = gone_after.expect("presence never expired");
    assert!(
        gone_after >= Duration::from_secs(29) && gone_after <= Duration::from_secs(31),
        "expired after {gone_after:?}"
    );
    // the others are still visible to each other
    assert!(net.peer(1).session.presence().peer(103).is_some());
    assert!(net.peer(3).session.presence().peer(101).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_presence_alive() {
    let mut net = three_member_room();
    net.set_presence(2, AwarenessPatch::new().cursor_pos(3));

    for second in 1..=120u64 {
        advance(Duration::from_secs(1)).await;
        if second % 10 == 0 {
            net.heartbeats();
        }
        net.sweep(Instant::now());
    }
    assert_eq!(cursor_of(&net, 1, 102), Some(3));
    assert_eq!(net.room.presence().peer_count(), 3);
}

#[test]
fn test_graceful_leave_removes_presence_immediately() {
    let mut net = three_member_room();
    net.set_presence(3, AwarenessPatch::new().cursor_pos(1).selection(1, 4));
    assert!(net.peer(1).session.presence().peer(103).is_some());

    net.leave(3);
    assert!(net.peer(1).session.presence().peer(103).is_none());
    assert!(net.peer(2).session.presence().peer(103).is_none());
    assert!(net.room.presence().peer(103).is_none());
}

#[test]
fn test_dropped_transport_removes_presence() {
    let mut net = three_member_room();
    net.set_presence(3, AwarenessPatch::new().cursor_pos(5));

    net.disconnect(3);
    assert!(net.peer(1).session.presence().peer(103).is_none());

    // on return the peer is announced again
    net.connect(3);
    assert_eq!(cursor_of(&net, 1, 103), Some(5));
}

#[test]
fn test_late_joiner_learns_existing_presence() {
    let mut net = Net::new(PresenceConfig::default());
    net.add_peer(1, 101);
    net.connect(1);
    net.set_presence(1, AwarenessPatch::new().display_name("ada").color("#e06c75").cursor_pos(7));

    net.add_peer(2, 102);
    net.connect(2);

    let peers = net.peer(2).session.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].fields.display_name, "ada");
    assert_eq!(peers[0].fields.color, "#e06c75");
    assert_eq!(peers[0].fields.cursor_pos, Some(7));
}

#[test]
fn test_selection_updates_are_field_wise() {
    let mut net = three_member_room();
    net.set_presence(1, AwarenessPatch::new().display_name("ada").selection(0, 3));
    net.set_presence(1, AwarenessPatch::new().cursor_pos(9));

    let seen = net.peer(2).session.presence().peer(101).cloned().unwrap();
    assert_eq!(seen.fields.display_name, "ada");
    assert_eq!(seen.fields.selection_range, Some((0, 3)));
    assert_eq!(seen.fields.cursor_pos, Some(9));

    net.set_presence(1, AwarenessPatch::new().clear_selection());
    let seen = net.peer(3).session.presence().peer(101).cloned().unwrap();
    assert_eq!(seen.fields.selection_range, None);
}

#[tokio::test]
async fn test_cursor_sync_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(RelayServer::new(RelayConfig::for_testing(None)).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let key = RoomKey::code("cursors");
    let url = format!("ws://127.0.0.1:{port}");
    let alice = SyncClient::connect(key.clone(), ClientConfig::for_testing(url.clone()));
    let bob = SyncClient::connect(key.clone(), ClientConfig::for_testing(url));

    let synced = timeout(Duration::from_secs(5), async {
        while alice.status() != ConnectionStatus::Synced || bob.status() != ConnectionStatus::Synced {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok());

    alice.set_presence(AwarenessPatch::new().display_name("alice").cursor_pos(4));
    let alice_id = alice.peer_id();
    let seen = timeout(Duration::from_secs(5), async {
        loop {
            let cursor = bob
                .peers()
                .into_iter()
                .find(|p| p.peer_id == alice_id)
                .and_then(|p| p.fields.cursor_pos);
            if cursor == Some(4) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(seen.is_ok(), "bob never saw alice's cursor");

    // closing announces the leave
    alice.close().await;
    let gone = timeout(Duration::from_secs(5), async {
        while bob.peers().iter().any(|p| p.peer_id == alice_id) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "alice still visible after leaving");
    bob.close().await;
}

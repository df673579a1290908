//! Persistence integration tests: the relay writes rooms to RocksDB and
//! restores them when members come back.

use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

use tutor_collab::client::{ClientConfig, SyncClient};
use tutor_collab::crdt::Document;
use tutor_collab::protocol::RoomKey;
use tutor_collab::server::{RelayConfig, RelayServer};
use tutor_collab::session::{ConnectionStatus, SessionEvent};
use tutor_collab::storage::{RoomStore, StoreConfig};

async fn start_relay(storage: &Path) -> (u16, Arc<RelayServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = RelayConfig::for_testing(Some(storage.to_path_buf()));
    let server = Arc::new(RelayServer::new(config).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (port, server)
}

fn client(port: u16, key: &RoomKey) -> SyncClient {
    SyncClient::connect(key.clone(), ClientConfig::for_testing(format!("ws://127.0.0.1:{port}")))
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn stored_text(store: &RoomStore, key: &RoomKey) -> Option<String> {
    let mut doc = Document::with_origin(1);
    let snapshot = store.load_snapshot(key).ok()??;
    doc.merge(&snapshot);
    for update in store.load_updates(key).ok()? {
        doc.merge(&update);
    }
    Some(doc.text())
}

#[test]
fn test_room_roundtrip_via_store() {
    let dir = tempdir().unwrap();
    let key = RoomKey::note("roundtrip");
    let mut doc = Document::with_origin(3);
    let first = doc.insert_text(0, "lecture notes").unwrap();
    let second = doc.delete_range(0..8).unwrap();

    {
        let store = RoomStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.append_update(&key, &first).unwrap();
        store.append_update(&key, &second).unwrap();
        assert_eq!(store.load_metadata(&key).unwrap().unwrap().logged_updates, 2);
    }

    let store = RoomStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let mut restored = Document::with_origin(4);
    for update in store.load_updates(&key).unwrap() {
        restored.merge(&update);
    }
    assert_eq!(restored.text(), "notes");

    store.save_snapshot(&key, &restored.snapshot()).unwrap();
    assert!(store.load_updates(&key).unwrap().is_empty());
    assert_eq!(stored_text(&store, &key).as_deref(), Some("notes"));
}

#[tokio::test]
async fn test_snapshot_on_last_leave() {
    let dir = tempdir().unwrap();
    let (port, server) = start_relay(&dir.path().join("relay")).await;
    let key = RoomKey::code("leave");

    let writer = client(port, &key);
    wait_for("synced", || writer.status() == ConnectionStatus::Synced).await;
    writer.insert_text(0, "print('saved')").unwrap();
    wait_for("acknowledged", || writer.unacked_len() == 0).await;

    let store = server.store().unwrap().clone();
    assert!(store.load_metadata(&key).unwrap().unwrap().logged_updates >= 1);

    writer.close().await;
    wait_for("snapshot written", || {
        store.load_snapshot(&key).ok().flatten().is_some()
    })
    .await;

    assert_eq!(stored_text(&store, &key).as_deref(), Some("print('saved')"));
    assert!(store.load_updates(&key).unwrap().is_empty());
    assert!(server.stats().await.persisted_snapshots >= 1);
}

#[tokio::test]
async fn test_room_reloaded_after_eviction() {
    let dir = tempdir().unwrap();
    let (port, server) = start_relay(&dir.path().join("relay")).await;
    let key = RoomKey::note("evicted");

    let writer = client(port, &key);
    wait_for("synced", || writer.status() == ConnectionStatus::Synced).await;
    writer.insert_text(0, "survives eviction").unwrap();
    wait_for("acknowledged", || writer.unacked_len() == 0).await;
    writer.close().await;

    let registry = server.registry().clone();
    let evicted = timeout(Duration::from_secs(5), async {
        while registry.room_count().await > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "room was never evicted");

    let reader = client(port, &key);
    wait_for("reader restored", || reader.text() == "survives eviction").await;
    reader.close().await;
}

#[tokio::test]
async fn test_restart_restores_snapshot_and_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("relay");
    let key = RoomKey::code("restart");

    // a previous relay process left a snapshot and one logged update behind
    {
        let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
        let mut doc = Document::with_origin(8);
        doc.insert_text(0, "fn main() {}").unwrap();
        store.save_snapshot(&key, &doc.snapshot()).unwrap();
        let tail = doc.insert_text(12, "\n").unwrap();
        store.append_update(&key, &tail).unwrap();
    }

    let (port, _server) = start_relay(&path).await;
    let reader = client(port, &key);
    wait_for("restored", || reader.text() == "fn main() {}\n").await;
    reader.close().await;
}

#[tokio::test]
async fn test_corrupt_snapshot_resets_room() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("relay");
    let key = RoomKey::note("corrupt");

    {
        let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
        store.save_raw_snapshot(&key, b"definitely not an update").unwrap();
    }

    let (port, server) = start_relay(&path).await;

    // this member still holds the content locally
    let mut local = Document::new();
    local.insert_text(0, "kept locally").unwrap();
    let mut survivor = SyncClient::connect_with_document(
        key.clone(),
        ClientConfig::for_testing(format!("ws://127.0.0.1:{port}")),
        local,
    );
    let mut events = survivor.take_event_rx().unwrap();

    let reset = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == SessionEvent::SessionReset {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(reset, Ok(true));
    assert_eq!(survivor.text(), "kept locally");

    // the relay adopted the member's replica
    let other = client(port, &key);
    wait_for("relay adopted replica", || other.text() == "kept locally").await;

    let store = server.store().unwrap().clone();
    wait_for("fresh snapshot", || {
        stored_text(&store, &key).as_deref() == Some("kept locally")
    })
    .await;

    survivor.close().await;
    other.close().await;
}

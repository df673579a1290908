//! WebSocket relay: routes connections to rooms by URL path.
//!
//! Architecture:
//! ```text
//! ws://host/code-session-42 ──┐
//!                              ├── RoomRegistry ── RoomActor(code-session-42)
//! ws://host/code-session-42 ──┘                        │
//!                                                      ├── Document (replica)
//! ws://host/note-session-42 ──── RoomActor(...)        ├── PresenceRoom
//!                                                      ├── BroadcastGroup
//!                                                      └── RoomStore (RocksDB)
//! ```
//!
//! The room key comes from the last path segment of the upgrade request;
//! anything that does not parse as `<code|note>-session-<id>` is refused
//! with HTTP 400 before the handshake completes. Each connection task only
//! shuttles bytes: frames go to the room actor, encoded frames come back
//! through the member's direct channel or the room broadcast.
//!
//! Reference: Kleppmann - Designing Data-Intensive Applications, Chapters 3 & 8

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, RoomKey};
use crate::room::{MemberId, Membership, RoomConfig, RoomRegistry};
use crate::storage::{RoomStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub room: RoomConfig,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            room: RoomConfig::default(),
            storage_path: None,
        }
    }
}

impl RelayConfig {
    pub fn for_testing(storage_path: Option<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            room: RoomConfig::for_testing(),
            storage_path,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    /// Frames that failed to decode.
    pub dropped_frames: u64,
    /// Members disconnected for falling behind the room broadcast.
    pub lagged_members: u64,
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub rooms_evicted: u64,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: RoomRegistry,
    stats: Arc<RwLock<RelayStats>>,
    store: Option<Arc<RoomStore>>,
    next_member: Arc<AtomicU64>,
}

impl RelayServer {
    /// Create a relay, opening the store if a storage path is configured.
    pub fn new(config: RelayConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store = RoomStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                info!("Room store opened at {}", path.display());
                Some(Arc::new(store))
            }
            None => None,
        };

        Ok(Self {
            registry: RoomRegistry::new(config.room.clone(), store.clone()),
            config,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            store,
            next_member: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Collab relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let member = self.next_member.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, member, registry, stats).await {
                    warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        member: MemberId,
        registry: RoomRegistry,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), BoxError> {
        let mut room_key = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match RoomKey::from_path(req.uri().path()) {
                Ok(key) => {
                    room_key = Some(key);
                    Ok(resp)
                }
                Err(e) => {
                    let mut reject = ErrorResponse::new(Some(e.to_string()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    Err(reject)
                }
            }
        })
        .await;

        let (ws_stream, key) = match (handshake, room_key) {
            (Ok(ws), Some(key)) => (ws, key),
            (result, _) => {
                stats.write().await.rejected_connections += 1;
                if let Err(e) = result {
                    debug!("Rejected connection from {addr}: {e}");
                }
                return Ok(());
            }
        };

        info!("Member {member} from {addr} joining room {key}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve_member(ws_stream, addr, member, &key, &registry, &stats).await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        info!("Member {member} left room {key}");
        result
    }

    async fn serve_member(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        member: MemberId,
        key: &RoomKey,
        registry: &RoomRegistry,
        stats: &Arc<RwLock<RelayStats>>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (direct_tx, mut direct_rx) = mpsc::unbounded_channel();

        let Membership { handle, mut receiver } = match registry.join(key, member, direct_tx).await {
            Ok(membership) => membership,
            Err(e) => {
                warn!("Member {member} could not join: {e}");
                let close = CloseFrame { code: CloseCode::Again, reason: e.to_string().into() };
                ws_sender.send(Message::Close(Some(close))).await?;
                return Ok(());
            }
        };

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match Frame::decode(&data) {
                                Ok(frame) => {
                                    trace!("Member {member} -> {:?}", frame.message_type());
                                    if !handle.send_frame(member, frame).await {
                                        warn!("Room {key} stopped under member {member}");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!("Dropping malformed frame from {addr}: {e}");
                                    stats.write().await.dropped_frames += 1;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    // Replies addressed to this member
                    Some(bytes) = direct_rx.recv() => {
                        ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                    }

                    // Room-wide traffic
                    msg = receiver.recv() => match msg {
                        Ok(envelope) => {
                            if envelope.is_for(member) {
                                ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // missed frames cannot be replayed here; the client resyncs on reconnect
                            warn!("Member {member} lagged by {n} frames, disconnecting");
                            stats.write().await.lagged_members += 1;
                            let close = CloseFrame {
                                code: CloseCode::Again,
                                reason: "lagged behind room traffic".into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(close))).await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            Ok(())
        }
        .await;

        handle.leave(member).await;
        if let Err(e) = &result {
            error!("Member {member} in room {key} failed: {e}");
        }
        result
    }

    /// Relay statistics, room counters included.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        let rooms = self.registry.stats().await;
        stats.active_rooms = self.registry.room_count().await;
        stats.rooms_created = rooms.rooms_created;
        stats.rooms_evicted = rooms.rooms_evicted;
        stats.persisted_updates = rooms.persisted_updates;
        stats.persisted_snapshots = rooms.persisted_snapshots;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<RoomStore>> {
        self.store.as_ref()
    }
}

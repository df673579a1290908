//! WebSocket driver for a [`SyncSession`].
//!
//! Provides:
//! - Connection lifecycle with exponential-backoff reconnect
//! - Synchronous local edits (the session lives behind a plain mutex)
//! - Presence heartbeat and timeout sweep
//! - Graceful close that flushes buffered frames
//!
//! ```text
//!  app thread ──insert_text()──► Mutex<ClientShared> ──Frame──► out channel
//!                                     ▲                             │
//!                 handle_frame()      │                             ▼
//!  ws reader ─────────────────────────┘      supervisor task ──► ws writer
//! ```
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::crdt::{Document, UnitId, UnitValue};
use crate::error::SyncError;
use crate::presence::{AwarenessPatch, PeerId, PeerPresence, PresenceConfig};
use crate::protocol::{Frame, RoomKey};
use crate::session::{ConnectionStatus, SessionEvent, SessionOutput, SyncSession};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Reconnect delays: `base * factor^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
    /// Retries after the first failed attempt before giving up.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2,
            max: Duration::from_secs(10),
            max_retries: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint; the room key is appended as the last path segment.
    pub server_url: String,
    /// Local updates allowed in flight before edits are refused.
    pub max_unacked: usize,
    pub backoff: BackoffConfig,
    pub presence: PresenceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            max_unacked: 10_000,
            backoff: BackoffConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            max_unacked: 10_000,
            backoff: BackoffConfig {
                base: Duration::from_millis(20),
                factor: 2,
                max: Duration::from_millis(200),
                max_retries: 5,
            },
            presence: PresenceConfig::for_testing(),
        }
    }
}

/// Backoff state for one reconnect cycle.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    retries: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Delay before the next retry, `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        let scale = self.config.factor.saturating_pow(self.retries);
        let delay = self.config.base.saturating_mul(scale).min(self.config.max);
        self.retries += 1;
        Some(delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────────

struct ClientShared {
    session: SyncSession,
    /// Present while a transport is open.
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
}

impl ClientShared {
    fn dispatch(&mut self, out: SessionOutput, events: &mpsc::UnboundedSender<SessionEvent>) {
        if let Some(tx) = &self.outgoing {
            for frame in out.frames {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        }
        for event in out.events {
            let _ = events.send(event);
        }
    }
}

fn lock(shared: &Mutex<ClientShared>) -> MutexGuard<'_, ClientShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// A participant connected to one room.
///
/// Edits apply immediately and never wait for the network.
pub struct SyncClient {
    room_key: RoomKey,
    shared: Arc<Mutex<ClientShared>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    manual_reconnect: Arc<Notify>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Start a client with a fresh document. Must be called inside a runtime.
    pub fn connect(room_key: RoomKey, config: ClientConfig) -> Self {
        Self::connect_with_document(room_key, config, Document::new())
    }

    /// Start a client over an existing replica.
    pub fn connect_with_document(room_key: RoomKey, config: ClientConfig, document: Document) -> Self {
        let session = SyncSession::new(document, config.presence.clone(), config.max_unacked);
        let shared = Arc::new(Mutex::new(ClientShared { session, outgoing: None }));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manual_reconnect = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let url = format!("{}/{}", config.server_url.trim_end_matches('/'), room_key);
        let supervisor = Supervisor {
            url,
            config,
            shared: shared.clone(),
            events: event_tx.clone(),
            manual_reconnect: manual_reconnect.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        Self {
            room_key,
            shared,
            event_tx,
            event_rx: Some(event_rx),
            manual_reconnect,
            cancel,
            supervisor: Mutex::new(Some(handle)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    fn apply<F>(&self, edit: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut SyncSession) -> Result<SessionOutput, SyncError>,
    {
        let mut shared = lock(&self.shared);
        match edit(&mut shared.session) {
            Ok(out) => {
                shared.dispatch(out, &self.event_tx);
                Ok(())
            }
            Err(SyncError::LocalBufferOverflow { queued }) => {
                warn!("Refusing local edit: {queued} updates unacknowledged");
                let _ = self
                    .event_tx
                    .send(SessionEvent::ManualReconnectRequired { queued });
                Err(SyncError::LocalBufferOverflow { queued })
            }
            Err(e) => Err(e),
        }
    }

    // ─── Local edits ─────────────────────────────────────────────

    pub fn insert_text(&self, pos: usize, text: &str) -> Result<(), SyncError> {
        self.apply(|s| s.insert_text(pos, text))
    }

    pub fn insert_at(&self, pos: usize, values: Vec<UnitValue>) -> Result<(), SyncError> {
        self.apply(|s| s.insert_at(pos, values))
    }

    pub fn delete_range(&self, range: std::ops::Range<usize>) -> Result<(), SyncError> {
        self.apply(|s| s.delete_range(range))
    }

    pub fn local_insert(&self, after: Option<UnitId>, value: UnitValue) -> Result<(), SyncError> {
        self.apply(|s| s.local_insert(after, value))
    }

    pub fn local_delete(&self, unit_id: UnitId) -> Result<(), SyncError> {
        self.apply(|s| s.local_delete(unit_id))
    }

    pub fn set_presence(&self, patch: AwarenessPatch) {
        let mut shared = lock(&self.shared);
        let out = shared.session.set_presence(patch);
        shared.dispatch(out, &self.event_tx);
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn text(&self) -> String {
        lock(&self.shared).session.text()
    }

    /// Run `f` against the local replica.
    pub fn with_document<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(lock(&self.shared).session.document())
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared).session.status()
    }

    pub fn peers(&self) -> Vec<PeerPresence> {
        lock(&self.shared).session.peers()
    }

    pub fn peer_id(&self) -> PeerId {
        lock(&self.shared).session.peer_id()
    }

    pub fn unacked_len(&self) -> usize {
        lock(&self.shared).session.unacked_len()
    }

    pub fn room_key(&self) -> &RoomKey {
        &self.room_key
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Retry after `ReconnectFailed`. Does nothing while the client is
    /// still connected or retrying on its own.
    pub fn manual_reconnect(&self) {
        self.manual_reconnect.notify_waiters();
    }

    /// Flush buffered frames, announce leave, and stop all tasks.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ───────────────────────────────────────────────────────────────────
// Supervisor task
// ───────────────────────────────────────────────────────────────────

struct Supervisor {
    url: String,
    config: ClientConfig,
    shared: Arc<Mutex<ClientShared>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    manual_reconnect: Arc<Notify>,
    cancel: CancellationToken,
}

impl Supervisor {
    fn emit(&self, events: Vec<SessionEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    async fn run(self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            self.emit(lock(&self.shared).session.begin_connect());

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = tokio_tungstenite::connect_async(self.url.as_str()) => r,
            };

            match attempt {
                Ok((ws, _)) => {
                    info!("Connected to {}", self.url);
                    backoff.reset();
                    self.run_connection(ws).await;
                }
                Err(e) => warn!("Connection to {} failed: {}", self.url, SyncError::from(e)),
            }

            if self.cancel.is_cancelled() {
                break;
            }

            match backoff.next_delay() {
                Some(delay) => {
                    debug!("Reconnecting in {delay:?} (retry {})", backoff.retries());
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    let attempts = backoff.retries() + 1;
                    warn!("Giving up on {} after {attempts} attempts", self.url);
                    {
                        let mut shared = lock(&self.shared);
                        let out = shared.session.on_transport_closed();
                        shared.dispatch(out, &self.events);
                    }
                    // registered before the event so a prompt retry is not missed
                    let retry = self.manual_reconnect.notified();
                    let _ = self.events.send(SessionEvent::ReconnectFailed { attempts });

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = retry => backoff.reset(),
                    }
                }
            }
        }

        let mut shared = lock(&self.shared);
        shared.outgoing = None;
        let out = shared.session.on_transport_closed();
        shared.dispatch(out, &self.events);
    }

    async fn run_connection(&self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        {
            let mut shared = lock(&self.shared);
            shared.outgoing = Some(out_tx);
            let out = shared.session.on_transport_open();
            shared.dispatch(out, &self.events);
        }

        let presence = &self.config.presence;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + presence.heartbeat_interval,
            presence.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(presence.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let closing = {
                        let mut shared = lock(&self.shared);
                        shared.outgoing = None;
                        shared.session.close_frames()
                    };
                    let mut pending: Vec<Frame> = std::iter::from_fn(|| out_rx.try_recv().ok()).collect();
                    pending.extend(closing);
                    for frame in &pending {
                        if send_frame(&mut sink, frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    info!("Closed connection to {}", self.url);
                    break;
                }

                Some(frame) = out_rx.recv() => {
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        warn!("Send failed: {e}");
                        break;
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                            Ok(frame) => {
                                let mut shared = lock(&self.shared);
                                let out = shared.session.handle_frame(frame);
                                shared.dispatch(out, &self.events);
                            }
                            Err(e) => warn!("Dropping undecodable frame: {}", SyncError::from(e)),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Relay closed the connection");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("Transport error: {}", SyncError::from(e));
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                _ = heartbeat.tick() => {
                    let mut shared = lock(&self.shared);
                    if let Some(frame) = shared.session.heartbeat() {
                        shared.dispatch(SessionOutput { frames: vec![frame], events: Vec::new() }, &self.events);
                    }
                }

                _ = sweep.tick() => {
                    let mut shared = lock(&self.shared);
                    let out = shared.session.sweep(Instant::now());
                    shared.dispatch(out, &self.events);
                }
            }
        }

        let mut shared = lock(&self.shared);
        shared.outgoing = None;
        if !self.cancel.is_cancelled() {
            let out = shared.session.on_transport_closed();
            shared.dispatch(out, &self.events);
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), SyncError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

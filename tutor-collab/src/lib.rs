//! # tutor-collab: Real-time collaborative editing for tutoring sessions
//!
//! Code buffers and notes shared between participants of a session. Each
//! participant edits a local replica; replicas exchange operations through a
//! relay and converge without coordination.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                       ┌──────────────────┐
//! │ LocalEditAdapter │                       │ RelayServer      │
//! └────────┬─────────┘                       └────────┬─────────┘
//!          ▼                                          ▼
//! ┌─────────────┐     WebSocket, one     ┌───────────────────────┐
//! │ SyncClient  │ ◄────────────────────► │ RoomRegistry          │
//! │ SyncSession │   frame per message    │  └─ RoomActor per key │
//! └──────┬──────┘                        └──────────┬────────────┘
//!        │                                          │
//!        ▼                                          ▼
//! ┌─────────────┐                     ┌──────────────────────────┐
//! │ Document    │                     │ Document (authoritative) │
//! │ PresenceRoom│                     │ PresenceRoom             │
//! └─────────────┘                     │ BroadcastGroup (fan-out) │
//!                                     │ RoomStore (RocksDB)      │
//!                                     └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`]: sequence CRDT, state vectors, updates
//! - [`protocol`]: binary frame codec and room keys
//! - [`presence`]: cursors, selections and liveness
//! - [`session`]: sans-IO client handshake and unacknowledged queue
//! - [`client`]: WebSocket driver with reconnect and backoff
//! - [`adapter`]: text widget boundary
//! - [`room`]: relay-side rooms, one task per room
//! - [`broadcast`]: per-room fan-out
//! - [`server`]: WebSocket relay
//! - [`storage`]: room snapshots and update log

pub mod adapter;
pub mod broadcast;
pub mod client;
pub mod crdt;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use adapter::{EditorView, LocalEditAdapter};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{Backoff, BackoffConfig, ClientConfig, SyncClient};
pub use crdt::{
    ClientId, ContentChange, CrdtError, Document, Operation, StateVector, UnitId, UnitValue,
    Update,
};
pub use error::SyncError;
pub use presence::{
    AwarenessFields, AwarenessMessage, AwarenessPatch, PeerId, PeerPresence, PresenceConfig,
    PresenceEvent, PresenceRoom,
};
pub use protocol::{DocumentKind, Frame, MessageType, ProtocolError, RoomKey};
pub use room::{RoomConfig, RoomError, RoomRegistry, RoomState};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{ConnectionStatus, SessionEvent, SessionState, SyncSession};
pub use storage::{RoomMetadata, RoomStore, StoreConfig, StoreError};

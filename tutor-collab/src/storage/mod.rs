//! Persistent storage for room replicas.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  applied updates  ┌──────────────┐
//! │ RoomActor   │ ────────────────► │ RoomStore    │
//! │ (in-memory) │  periodic / last  │ (RocksDB)    │
//! └──────┬──────┘  leave snapshots  └──────┬───────┘
//!        │                                 │ column families
//!        │ on first join                   ▼
//!        ▼                  ┌───────────────────────────────────┐
//! snapshot + logged         │ CF "snapshots" - full state (LZ4) │
//! updates, merged           │ CF "updates"   - log since snapshot│
//!                           │ CF "metadata"  - per-room counters │
//!                           └───────────────────────────────────┘
//! ```
//!
//! Merge is idempotent, so replaying a log entry already covered by the
//! snapshot is harmless.
//!
//! Reference: Kleppmann - Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{room_id, RoomMetadata, RoomStore, StoreConfig, StoreError};

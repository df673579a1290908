//! Replicated sequence CRDT for collaborative code buffers and notes.
//!
//! Architecture:
//! ```text
//!   local edit                      remote Update
//!       │                                │
//!       ▼                                ▼
//! Document::apply_local_insert    Document::merge
//!       │                                │
//!       └──────────────┬─────────────────┘
//!                      ▼
//!            readiness check ──► pending buffer (origin missing / clock gap)
//!                      │                 ▲ retried after each integration
//!                      ▼                 │
//!              YATA integration ─────────┘
//!                      │
//!        ┌─────────────┼──────────────┐
//!        ▼             ▼              ▼
//!   units (arena)  order (blocks)   history (diff source)
//! ```
//!
//! Every operation, insert or delete, consumes one clock tick of its
//! author's origin, so a [`StateVector`] summarises everything a replica
//! has integrated and [`Document::diff`] is exact.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared
//! Editing on Extensible Data Types" (YATA), GROUP 2016

pub mod document;
pub mod id;
mod order;
pub mod update;

pub use document::{ContentChange, CrdtError, Document, Merged, DEFAULT_PENDING_LIMIT};
pub use id::{ClientId, StateVector, UnitId};
pub use update::{ContentUnit, Operation, UnitValue, Update};

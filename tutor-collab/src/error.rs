//! Error taxonomy of the sync layer.

use thiserror::Error;

use crate::crdt::CrdtError;
use crate::protocol::ProtocolError;

/// Errors surfaced by sessions, clients and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Connection failed or dropped. Retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded. The frame is dropped.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Replicas can no longer be reconciled; local state was reset.
    #[error("replica diverged: {0}")]
    Divergence(String),

    /// Too many local updates are waiting for acknowledgement.
    #[error("local buffer overflow: {queued} updates awaiting acknowledgement")]
    LocalBufferOverflow { queued: usize },

    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

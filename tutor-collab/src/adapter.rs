//! Boundary between a text widget and the sync client.
//!
//! The widget reports edits by visible position; the adapter turns them into
//! CRDT operations through the client. Remote changes and presence changes
//! come back as render callbacks on an [`EditorView`].

use log::{debug, info, warn};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::client::SyncClient;
use crate::error::SyncError;
use crate::presence::{AwarenessPatch, PeerPresence};
use crate::session::{ConnectionStatus, SessionEvent};

/// Rendering side of an editor.
pub trait EditorView {
    /// The document text changed because of a remote edit.
    fn on_remote_content_changed(&mut self, text: &str);

    /// The set of remote peers or their cursors changed.
    fn on_presence_changed(&mut self, peers: &[PeerPresence]);

    fn on_status_changed(&mut self, _status: ConnectionStatus) {}
}

/// Feeds widget edits into a [`SyncClient`] and session events into a view.
pub struct LocalEditAdapter<V> {
    client: Arc<SyncClient>,
    view: V,
}

impl<V: EditorView> LocalEditAdapter<V> {
    pub fn new(client: Arc<SyncClient>, view: V) -> Self {
        Self { client, view }
    }

    /// The user typed `text` at visible position `pos`.
    pub fn on_local_insert(&mut self, pos: usize, text: &str) -> Result<(), SyncError> {
        if text.is_empty() {
            return Ok(());
        }
        self.client.insert_text(pos, text)
    }

    /// The user deleted the visible positions in `range`.
    pub fn on_local_delete(&mut self, range: Range<usize>) -> Result<(), SyncError> {
        if range.is_empty() {
            return Ok(());
        }
        self.client.delete_range(range)
    }

    /// The caret moved; a collapsed selection clears the selection field.
    pub fn on_local_cursor(&mut self, pos: usize, selection: Option<Range<usize>>) {
        let patch = AwarenessPatch::new().cursor_pos(pos as u64);
        let patch = match selection {
            Some(range) if !range.is_empty() => patch.selection(range.start as u64, range.end as u64),
            _ => patch.clear_selection(),
        };
        self.client.set_presence(patch);
    }

    /// Route one session event to the view.
    pub fn handle_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::RemoteChange(_) => {
                self.view.on_remote_content_changed(&self.client.text());
            }
            SessionEvent::Presence(_) => {
                self.view.on_presence_changed(&self.client.peers());
            }
            SessionEvent::StatusChanged(status) => self.view.on_status_changed(*status),
            SessionEvent::SessionReset => {
                info!("Room {} was reset by the relay", self.client.room_key());
                self.view.on_remote_content_changed(&self.client.text());
            }
            SessionEvent::ManualReconnectRequired { queued } => {
                warn!("{queued} edits unacknowledged; reconnect needed before editing further");
            }
            SessionEvent::ReconnectFailed { attempts } => {
                warn!("Gave up reconnecting after {attempts} attempts");
            }
        }
    }

    /// Drive the view until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> V {
        while let Some(event) = events.recv().await {
            self.handle_event(&event);
        }
        debug!("Event channel closed, adapter stopping");
        self.view
    }

    pub fn client(&self) -> &Arc<SyncClient> {
        &self.client
    }

    pub fn view(&self) -> &V {
        &self.view
    }
}

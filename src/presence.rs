//! Presence tracking.
//!
//! Binds each live connection handle to its participant identity and,
//! once the participant joins a room, to that (room, participant) pair.
//! The back-reference is non-owning bookkeeping: RoomRegistry owns
//! membership, this exists so disconnect cleanup knows what to release.

use std::sync::Arc;

use dashmap::DashMap;

use crate::rooms::ConnId;

/// Where a connection is currently attached. A handle is in at most
/// one room; attaching to a new room replaces this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub room_id: String,
    pub participant_id: String,
}

/// What a disconnected handle was doing, handed to exactly one caller.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub participant_id: String,
    pub attachment: Option<Attachment>,
}

#[derive(Debug)]
struct Presence {
    participant_id: String,
    display_name: String,
    attachment: Option<Attachment>,
}

/// Tracker of live connections. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    connections: Arc<DashMap<ConnId, Presence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly registered connection.
    pub fn register(&self, handle: ConnId, participant_id: &str, display_name: &str) {
        tracing::info!(
            handle = %handle,
            participant_id = participant_id,
            "Connection registered"
        );
        self.connections.insert(
            handle,
            Presence {
                participant_id: participant_id.to_string(),
                display_name: display_name.to_string(),
                attachment: None,
            },
        );
    }

    /// Attach a handle to a room. Overwrites any prior attachment and
    /// returns it so the caller can release the old room's slot; a
    /// handle joining a new room implicitly leaves the old one.
    pub fn attach(&self, handle: ConnId, room_id: &str) -> Option<Attachment> {
        let mut presence = self.connections.get_mut(&handle)?;
        let previous = presence.attachment.take();
        presence.attachment = Some(Attachment {
            room_id: room_id.to_string(),
            participant_id: presence.participant_id.clone(),
        });
        previous
    }

    /// Clear a handle's attachment if it points at the given room.
    /// Returns the cleared attachment. A stale detach for a room the
    /// handle already moved on from is a no-op.
    pub fn detach(&self, handle: ConnId, room_id: &str) -> Option<Attachment> {
        let mut presence = self.connections.get_mut(&handle)?;
        match &presence.attachment {
            Some(attachment) if attachment.room_id == room_id => presence.attachment.take(),
            _ => None,
        }
    }

    /// Tear down a disconnected handle's bookkeeping.
    ///
    /// The map removal yields the record to at most one caller, which
    /// is the exactly-once guarantee: a disconnect racing a concurrent
    /// cleanup produces the tuple on exactly one path.
    pub fn on_disconnect(&self, handle: ConnId) -> Option<Disconnected> {
        let (_, presence) = self.connections.remove(&handle)?;
        tracing::info!(
            handle = %handle,
            participant_id = presence.participant_id.as_str(),
            "Connection removed"
        );
        Some(Disconnected {
            participant_id: presence.participant_id,
            attachment: presence.attachment,
        })
    }

    /// Participant id bound to a handle, if still connected.
    pub fn participant_id(&self, handle: ConnId) -> Option<String> {
        self.connections
            .get(&handle)
            .map(|p| p.participant_id.clone())
    }

    /// Advisory display name bound to a handle.
    pub fn display_name(&self, handle: ConnId) -> Option<String> {
        self.connections
            .get(&handle)
            .map(|p| p.display_name.clone())
    }

    /// Map a set of handles to their participant ids, skipping handles
    /// that disconnected in the meantime.
    pub fn participant_ids(&self, handles: &[ConnId]) -> Vec<String> {
        handles
            .iter()
            .filter_map(|h| self.participant_id(*h))
            .collect()
    }

    /// Number of live registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

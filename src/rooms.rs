//! Room registry.
//!
//! Authoritative in-memory map of rooms to member connection handles.
//! Rooms are created lazily on first join and deleted synchronously
//! when the last member leaves; no orphan rooms survive a voluntary
//! leave. Membership is keyed by connection handle, not participant id,
//! because a participant may reconnect under a new handle.
//!
//! Operations on the same room go through that room's map entry, so
//! join/leave/membership-snapshot are serialized per room while rooms
//! stay independent of each other.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Ephemeral handle for one live connection (push socket or poll
/// subscriber). Only meaningful to its transport.
pub type ConnId = Uuid;

#[derive(Debug)]
struct Room {
    members: HashSet<ConnId>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Room {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            members: HashSet::new(),
            created_at: now,
            last_activity: now,
        }
    }
}

/// What a leave did: who remains, and whether this call deleted the
/// emptied room.
#[derive(Debug, Default)]
pub struct LeaveOutcome {
    pub remaining: Vec<ConnId>,
    pub deleted: bool,
}

/// Registry of live rooms. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle to a room, creating the room if absent. Idempotent.
    pub fn join(&self, room_id: &str, handle: ConnId) {
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(Room::new);
        let added = room.members.insert(handle);
        room.last_activity = Utc::now();

        if added {
            tracing::info!(
                room_id = room_id,
                handle = %handle,
                member_count = room.members.len(),
                "Handle joined room"
            );
        }
    }

    /// Remove a handle from a room. No-op on an absent room; transport
    /// retries can arrive after the room was already cleaned up.
    /// Deletes the room synchronously when it empties; the delete
    /// rechecks emptiness so it can race a concurrent join safely, and
    /// the outcome reports whether this call deleted the room so the
    /// caller purges retained state only for a room that is truly gone.
    pub fn leave(&self, room_id: &str, handle: ConnId) -> LeaveOutcome {
        let remaining = if let Some(mut room) = self.rooms.get_mut(room_id) {
            if room.members.remove(&handle) {
                room.last_activity = Utc::now();
            }
            room.members.iter().copied().collect::<Vec<_>>()
        } else {
            return LeaveOutcome::default();
        };

        let mut deleted = false;
        if remaining.is_empty() {
            // Recheck under the entry lock: a join may have landed
            // between dropping the guard above and this removal.
            deleted = self
                .rooms
                .remove_if(room_id, |_, room| room.members.is_empty())
                .is_some();
            if deleted {
                tracing::debug!(room_id = room_id, "Removed empty room");
            }
        } else {
            tracing::debug!(
                room_id = room_id,
                handle = %handle,
                remaining = remaining.len(),
                "Handle left room"
            );
        }

        LeaveOutcome { remaining, deleted }
    }

    /// Snapshot of a room's membership. Empty if the room doesn't exist.
    pub fn members(&self, room_id: &str) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Membership snapshot minus one handle, read in a single entry
    /// access so the relay computes its delivery set against a
    /// consistent view.
    pub fn members_excluding(&self, room_id: &str, excluded: ConnId) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .copied()
                    .filter(|h| *h != excluded)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a room currently exists with at least one member.
    pub fn is_live(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|room| !room.members.is_empty())
            .unwrap_or(false)
    }

    /// Bump a room's last-activity clock (called on relay traffic).
    pub fn touch(&self, room_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.last_activity = Utc::now();
        }
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Ids of all current rooms (for the reaper's orphan scan).
    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    /// Reaper sweep: delete rooms that are empty and idle past the
    /// threshold. The normal path already deletes on last leave, so
    /// this only catches rooms stranded by an interrupted cleanup.
    /// The removal rechecks emptiness at delete time, never a blind
    /// time-based delete. Returns the ids of reaped rooms.
    pub fn sweep_idle(&self, idle_threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now() - idle_threshold;

        let candidates: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.members.is_empty() && entry.last_activity < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for room_id in candidates {
            let removed = self
                .rooms
                .remove_if(&room_id, |_, room| {
                    room.members.is_empty() && room.last_activity < cutoff
                })
                .is_some();
            if removed {
                reaped.push(room_id);
            }
        }

        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "Reaped idle rooms");
        }
        reaped
    }

    /// Age of a room since creation, if it exists. Diagnostic only.
    pub fn room_age(&self, room_id: &str) -> Option<chrono::Duration> {
        self.rooms
            .get(room_id)
            .map(|room| Utc::now() - room.created_at)
    }
}

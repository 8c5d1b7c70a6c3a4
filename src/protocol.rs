//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol on the push
//! channel and the same envelope shapes over the poll REST surface.
//! Signal payloads are opaque to the relay; it routes by envelope
//! fields and never inspects offer/answer/ICE contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Signal Envelope ───────────────────────────────────────────────────────────

/// The kind of handshake payload being relayed.
///
/// Anything outside this enumeration fails deserialization and the
/// whole message is dropped (malformed messages are logged, never
/// surfaced to the sender).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// A relayed signal as seen by recipients.
///
/// `seq` is assigned server-side per (room, sender) so each recipient
/// observes a never-reordered subsequence of the sender's send order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub room_id: String,
    pub kind: SignalKind,
    /// Opaque handshake blob. Passed through unmodified.
    pub payload: String,
    /// Participant id of the sender, for echo filtering.
    pub from: String,
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
}

// ── Call Invites ──────────────────────────────────────────────────────────────

/// Lifecycle of a call invite. Transitions only move forward:
/// Ringing → Accepted → Ended, or Ringing → Ended (decline/timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Ringing,
    Accepted,
    Ended,
}

/// One caller-to-invitee call request.
///
/// Group calls create one record per invitee; all records of a group
/// share a room id and a room-scoped accepted-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInvite {
    pub invite_id: String,
    pub room_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub invitee_id: String,
    pub invitee_name: String,
    pub status: InviteStatus,
    pub is_group: bool,
    /// Everyone named on the invite (caller + all invitees). Group only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An invitee named on a `create_invite` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitee {
    pub id: String,
    pub name: String,
}

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to an (already authenticated) participant.
    /// Must be sent first after connecting.
    Register {
        participant_id: String,
        #[serde(default)]
        display_name: String,
    },

    /// Join a room. Idempotent; creates the room if absent. A
    /// connection may only be in one room; joining a new room
    /// implicitly leaves the old one.
    JoinRoom {
        room_id: String,
    },

    /// Leave a room. No-op if the room doesn't exist.
    LeaveRoom {
        room_id: String,
    },

    /// Relay a handshake payload to the other members of a room.
    Signal {
        room_id: String,
        kind: SignalKind,
        payload: String,
    },

    /// Ring one or more participants. One invitee derives a
    /// deterministic 1:1 room id; two or more mint a fresh group room.
    CreateInvite {
        invitees: Vec<Invitee>,
    },

    /// Accept an incoming invite. Silently ignored if already ended.
    AcceptInvite {
        invite_id: String,
    },

    /// End an invite (decline while ringing, or hang up). Idempotent.
    EndInvite {
        invite_id: String,
    },

    /// Ping to keep the connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay to a client over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful registration.
    Registered {
        participant_id: String,
    },

    /// Acknowledgement of a room join, with the participant ids of
    /// everyone already in the room.
    RoomJoined {
        room_id: String,
        participants: Vec<String>,
    },

    /// Another participant joined the room.
    ParticipantJoined {
        room_id: String,
        participant_id: String,
    },

    /// Another participant left the room (voluntarily or by disconnect).
    ParticipantLeft {
        room_id: String,
        participant_id: String,
    },

    /// A handshake payload relayed from another room member.
    Signal(SignalEnvelope),

    /// Response to CreateInvite; the room id both sides will meet in
    /// and the per-invitee invite record ids.
    InviteCreated {
        room_id: String,
        invite_ids: Vec<String>,
    },

    /// A new invite addressed to this participant, delivered while it
    /// is still ringing.
    IncomingInvite {
        invite: CallInvite,
    },

    /// An invite's status changed (accepted, ended, timed out). The
    /// accepted-set is the room-scoped set shared by all records of a
    /// group invite.
    InviteStatus {
        invite_id: String,
        room_id: String,
        status: InviteStatus,
        accepted: Vec<String>,
    },

    /// Pong response to keep the connection alive.
    Pong,

    /// Protocol-state error (e.g. message before register). Malformed
    /// payloads never produce this; they are dropped and logged.
    Error {
        message: String,
    },
}

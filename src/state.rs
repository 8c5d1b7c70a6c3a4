//! Server state.
//!
//! Bundles the registry, presence tracker, transports, relay, and
//! invite coordinator behind one cloneable handle, plus the outbound
//! channel map for connected push clients. All shared structures are
//! concurrent (DashMap); no global lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::invites::CallInviteCoordinator;
use crate::presence::PresenceTracker;
use crate::protocol::ServerMessage;
use crate::relay::SignalRelay;
use crate::rooms::{ConnId, RoomRegistry};
use crate::transport::{PollTransport, PushTransport};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// How long an invite may ring before the reaper ends it.
    pub ring_timeout_secs: i64,
    /// How long an empty room may sit idle before the reaper takes it.
    pub room_idle_secs: i64,
    /// How long ended invite records are kept for late lookups.
    pub invite_retention_secs: i64,
    /// Poll subscribers quiet for longer than this are presumed dead.
    pub poll_subscriber_ttl_secs: i64,
    /// Seconds between reaper sweeps.
    pub reaper_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            ring_timeout_secs: 45,
            room_idle_secs: 300,
            invite_retention_secs: 600,
            poll_subscriber_ttl_secs: 60,
            reaper_interval_secs: 120,
        }
    }
}

/// A connected push client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Shared server state. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct RelayState {
    pub rooms: RoomRegistry,
    pub presence: PresenceTracker,
    pub relay: SignalRelay,
    pub invites: CallInviteCoordinator,
    pub poll: PollTransport,

    /// Participant id → outbound channel for connected push clients.
    /// Invite and membership events are delivered through here; poll
    /// participants have no entry and simply aren't pushed to.
    clients: Arc<DashMap<String, ClientSender>>,

    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = RoomRegistry::new();
        let push = PushTransport::new();
        let poll = PollTransport::new();
        let relay = SignalRelay::new(rooms.clone(), push, poll.clone());

        Self {
            rooms,
            presence: PresenceTracker::new(),
            relay,
            invites: CallInviteCoordinator::new(),
            poll,
            clients: Arc::new(DashMap::new()),
            config,
        }
    }

    // ── Push Client Management ────────────────────────────────────────────

    /// Bind a participant's outbound channel. A reconnect replaces the
    /// previous connection's channel.
    pub fn register_client(&self, participant_id: &str, sender: ClientSender) {
        self.clients.insert(participant_id.to_string(), sender);
    }

    /// Drop a participant's outbound channel, but only if it still
    /// belongs to the disconnecting connection; the participant may
    /// have reconnected under a new channel already.
    pub fn unregister_client(&self, participant_id: &str, sender: &ClientSender) {
        self.clients
            .remove_if(participant_id, |_, current| current.same_channel(sender));
    }

    /// Send a message to a connected push client. Returns false if the
    /// participant has no live push connection.
    pub fn send_to_participant(&self, participant_id: &str, message: ServerMessage) -> bool {
        if let Some(sender) = self.clients.get(participant_id) {
            sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Notify a set of connection handles (resolved through presence)
    /// about a room membership change.
    pub fn notify_handles(&self, handles: &[ConnId], message: ServerMessage) {
        for participant_id in self.presence.participant_ids(handles) {
            self.send_to_participant(&participant_id, message.clone());
        }
    }

    /// Number of connected push clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

//! Background sweep for everything that can go stale: unanswered
//! invites, ended invites past retention, poll subscribers that
//! stopped heartbeating, idle empty rooms, and orphaned poll logs.
//!
//! Every sweep rechecks its condition at delete time, so a resource
//! that came back to life between the scan and the removal survives.

use chrono::Duration;

use crate::protocol::ServerMessage;
use crate::state::RelayState;

/// Spawn the periodic reaper task.
pub fn spawn(state: RelayState) {
    let interval_secs = state.config.reaper_interval_secs;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        // The first tick fires immediately; skip it so a fresh server
        // doesn't sweep an empty map.
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep(&state);
        }
    });
    tracing::info!(interval_secs, "Reaper started");
}

/// Run one full sweep pass.
pub fn sweep(state: &RelayState) {
    let config = &state.config;

    // Invites still ringing past the timeout. Ending them fires the
    // per-invite status watch, which tells both sides to stop waiting.
    let expired = state
        .invites
        .expire_ringing(Duration::seconds(config.ring_timeout_secs));
    for invite in &expired {
        tracing::info!(
            invite_id = invite.invite_id.as_str(),
            caller_id = invite.caller_id.as_str(),
            invitee_id = invite.invitee_id.as_str(),
            "Invite rang out"
        );
    }

    // Ended invites past retention. Kept around that long so late
    // status queries still resolve.
    let dropped = state
        .invites
        .sweep_ended(Duration::seconds(config.invite_retention_secs));
    if dropped > 0 {
        tracing::debug!(count = dropped, "Dropped ended invites past retention");
    }

    // Poll subscribers whose heartbeat lapsed. Each one gets the same
    // teardown as a graceful leave, exactly once.
    let dead = state
        .poll
        .sweep_dead(Duration::seconds(config.poll_subscriber_ttl_secs));
    for sub in dead {
        state.presence.on_disconnect(sub.handle);
        let remaining = state.relay.leave(&sub.room_id, sub.handle);
        state.notify_handles(
            &remaining,
            ServerMessage::ParticipantLeft {
                room_id: sub.room_id.clone(),
                participant_id: sub.participant_id.clone(),
            },
        );
        tracing::info!(
            room_id = sub.room_id.as_str(),
            participant_id = sub.participant_id.as_str(),
            "Reaped dead poll subscriber"
        );
    }

    // Empty rooms idle past the threshold, then their transport state.
    let reaped = state
        .rooms
        .sweep_idle(Duration::seconds(config.room_idle_secs));
    for room_id in &reaped {
        // The room may have been re-created since the sweep confirmed
        // its removal; purging then would wipe the live session's
        // transport state.
        if state.rooms.is_live(room_id) {
            continue;
        }
        state.relay.purge_room(room_id);
        tracing::info!(room_id = room_id.as_str(), "Reaped idle room");
    }

    // Poll logs whose room no longer exists anywhere.
    let orphans = state.poll.sweep_orphans(&state.rooms.room_ids());
    if orphans > 0 {
        tracing::debug!(count = orphans, "Dropped orphaned poll logs");
    }
}

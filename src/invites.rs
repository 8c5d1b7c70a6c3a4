//! Call invite coordination.
//!
//! Owns the invite lifecycle: ringing → accepted → ended, or ringing →
//! ended on decline/timeout. Transitions only move forward; a stale
//! write can never resurrect an ended invite. Group calls create one
//! record per invitee, all sharing a room id and a room-scoped
//! accepted-set; each record still ends independently when its invitee
//! hangs up.
//!
//! Room id derivation: a 1:1 invite uses the two participant ids
//! lexically sorted and joined, so simultaneous invites from both
//! sides converge on the same room with no discovery round-trip. A
//! group invite's membership is caller-defined, not derivable from a
//! pair, so its room id is minted fresh per invocation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::protocol::{CallInvite, InviteStatus, Invitee};

/// Result of creating an invite: the room everyone will meet in and
/// the per-invitee records that went out ringing.
#[derive(Debug)]
pub struct InviteCreation {
    pub room_id: String,
    pub invites: Vec<CallInvite>,
}

/// Deterministic 1:1 room id; order-independent in its two inputs.
pub fn one_to_one_room_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// Coordinator of invite state. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct CallInviteCoordinator {
    invites: Arc<DashMap<String, CallInvite>>,
    /// Room id → accepted participants. Grows monotonically while any
    /// of the room's invites is still live.
    accepted: Arc<DashMap<String, HashSet<String>>>,
    /// Invite id → status feed for acceptance subscriptions.
    status_feeds: Arc<DashMap<String, watch::Sender<InviteStatus>>>,
    /// Participant id → live feed of invites newly ringing for them.
    incoming: Arc<DashMap<String, mpsc::UnboundedSender<CallInvite>>>,
}

impl CallInviteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring one or more participants. Returns None for an empty
    /// invitee list (malformed, dropped upstream).
    pub fn create_invite(
        &self,
        caller_id: &str,
        caller_name: &str,
        invitees: &[Invitee],
    ) -> Option<InviteCreation> {
        if invitees.is_empty() {
            return None;
        }

        let now = Utc::now();
        let is_group = invitees.len() > 1;
        let room_id = if is_group {
            format!("{}_{}", caller_id, now.timestamp_millis())
        } else {
            one_to_one_room_id(caller_id, &invitees[0].id)
        };

        let participants: Option<Vec<String>> = is_group.then(|| {
            std::iter::once(caller_id.to_string())
                .chain(invitees.iter().map(|i| i.id.clone()))
                .collect()
        });

        // The caller is in their own call from the start.
        self.accepted
            .entry(room_id.clone())
            .or_default()
            .insert(caller_id.to_string());

        let mut invites = Vec::with_capacity(invitees.len());
        for invitee in invitees {
            let invite = CallInvite {
                invite_id: Uuid::new_v4().to_string(),
                room_id: room_id.clone(),
                caller_id: caller_id.to_string(),
                caller_name: caller_name.to_string(),
                invitee_id: invitee.id.clone(),
                invitee_name: invitee.name.clone(),
                status: InviteStatus::Ringing,
                is_group,
                participants: participants.clone(),
                created_at: now,
                updated_at: now,
            };

            let (status_tx, _) = watch::channel(InviteStatus::Ringing);
            self.status_feeds
                .insert(invite.invite_id.clone(), status_tx);
            self.invites
                .insert(invite.invite_id.clone(), invite.clone());

            // Deliver to the invitee's live feed if they're listening.
            if let Some(feed) = self.incoming.get(&invitee.id) {
                if feed.send(invite.clone()).is_err() {
                    drop(feed);
                    self.incoming.remove(&invitee.id);
                }
            }

            invites.push(invite);
        }

        tracing::info!(
            room_id = room_id.as_str(),
            caller = caller_id,
            invitee_count = invites.len(),
            is_group = is_group,
            "Created call invite"
        );

        Some(InviteCreation { room_id, invites })
    }

    /// Accept an invite. Moves ringing → accepted and adds the invitee
    /// to the room's accepted-set. A late accept on an already-ended
    /// invite is silently ignored. Returns the updated record when the
    /// accept took effect.
    pub fn accept(&self, invite_id: &str) -> Option<CallInvite> {
        let mut invite = self.invites.get_mut(invite_id)?;
        match invite.status {
            InviteStatus::Ringing => {
                invite.status = InviteStatus::Accepted;
                invite.updated_at = Utc::now();
            }
            // A repeated accept is idempotent.
            InviteStatus::Accepted => {}
            // Too late: timeout or decline won. Not an error.
            InviteStatus::Ended => {
                tracing::debug!(invite_id = invite_id, "Late accept ignored");
                return None;
            }
        }

        self.accepted
            .entry(invite.room_id.clone())
            .or_default()
            .insert(invite.invitee_id.clone());

        if let Some(feed) = self.status_feeds.get(invite_id) {
            let _ = feed.send(InviteStatus::Accepted);
        }

        tracing::info!(
            invite_id = invite_id,
            room_id = invite.room_id.as_str(),
            invitee = invite.invitee_id.as_str(),
            "Invite accepted"
        );
        Some(invite.clone())
    }

    /// End an invite (decline while ringing, or hang up). Idempotent;
    /// returns the record only when this call performed the
    /// transition, so notifications fire once.
    pub fn end(&self, invite_id: &str) -> Option<CallInvite> {
        let mut invite = self.invites.get_mut(invite_id)?;
        if invite.status == InviteStatus::Ended {
            return None;
        }
        invite.status = InviteStatus::Ended;
        invite.updated_at = Utc::now();

        if let Some(feed) = self.status_feeds.get(invite_id) {
            let _ = feed.send(InviteStatus::Ended);
        }

        tracing::info!(
            invite_id = invite_id,
            room_id = invite.room_id.as_str(),
            "Invite ended"
        );
        Some(invite.clone())
    }

    /// Snapshot of an invite record.
    pub fn get(&self, invite_id: &str) -> Option<CallInvite> {
        self.invites.get(invite_id).map(|i| i.clone())
    }

    /// The room-scoped accepted-set shared by all records of a room.
    pub fn accepted_set(&self, room_id: &str) -> Vec<String> {
        self.accepted
            .get(room_id)
            .map(|set| {
                let mut ids: Vec<String> = set.iter().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Live feed of invites newly ringing for a participant. Replaces
    /// any previous feed for the same participant; dropping the
    /// receiver (or disconnecting) cancels it; no delivery fires
    /// after that.
    pub fn subscribe_incoming(&self, participant_id: &str) -> mpsc::UnboundedReceiver<CallInvite> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.incoming.insert(participant_id.to_string(), tx);
        rx
    }

    /// Tear down a participant's incoming feed on disconnect.
    pub fn unsubscribe_incoming(&self, participant_id: &str) {
        self.incoming.remove(participant_id);
    }

    /// Asynchronous status feed for one invite, so the caller learns
    /// of accept/end the moment it happens rather than by polling.
    pub fn subscribe_acceptance(&self, invite_id: &str) -> Option<watch::Receiver<InviteStatus>> {
        self.status_feeds.get(invite_id).map(|tx| tx.subscribe())
    }

    /// The live (not ended) invite between a caller and callee, for
    /// acceptance subscriptions keyed by the pair instead of the id.
    pub fn find_live_pair(&self, caller_id: &str, invitee_id: &str) -> Option<CallInvite> {
        self.invites
            .iter()
            .find(|invite| {
                invite.caller_id == caller_id
                    && invite.invitee_id == invitee_id
                    && invite.status != InviteStatus::Ended
            })
            .map(|invite| invite.clone())
    }

    /// Number of invites currently ringing.
    pub fn ringing_count(&self) -> usize {
        self.invites
            .iter()
            .filter(|i| i.status == InviteStatus::Ringing)
            .count()
    }

    /// Reaper sweep: move invites still ringing past the timeout to
    /// ended, through the same forward-only transition as an explicit
    /// end. Returns the expired records for notification.
    pub fn expire_ringing(&self, ring_timeout: Duration) -> Vec<CallInvite> {
        let cutoff = Utc::now() - ring_timeout;

        let stale: Vec<String> = self
            .invites
            .iter()
            .filter(|i| i.status == InviteStatus::Ringing && i.created_at < cutoff)
            .map(|i| i.invite_id.clone())
            .collect();

        let mut expired = Vec::new();
        for invite_id in stale {
            // Recheck and flip under the entry, so an accept that
            // raced the sweep wins and the invite is left alone.
            let timed_out = {
                let Some(mut invite) = self.invites.get_mut(&invite_id) else {
                    continue;
                };
                if invite.status != InviteStatus::Ringing || invite.created_at >= cutoff {
                    continue;
                }
                invite.status = InviteStatus::Ended;
                invite.updated_at = Utc::now();
                invite.clone()
            };

            if let Some(feed) = self.status_feeds.get(&invite_id) {
                let _ = feed.send(InviteStatus::Ended);
            }
            expired.push(timed_out);
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired unanswered invites");
        }
        expired
    }

    /// Reaper sweep: forget ended invites that have been quiet past
    /// `retention`, along with their status feeds, and drop
    /// accepted-sets whose rooms have no remaining invite records.
    pub fn sweep_ended(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;

        let done: Vec<String> = self
            .invites
            .iter()
            .filter(|i| i.status == InviteStatus::Ended && i.updated_at < cutoff)
            .map(|i| i.invite_id.clone())
            .collect();

        let mut removed = 0;
        for invite_id in &done {
            if self
                .invites
                .remove_if(invite_id, |_, i| {
                    i.status == InviteStatus::Ended && i.updated_at < cutoff
                })
                .is_some()
            {
                self.status_feeds.remove(invite_id);
                removed += 1;
            }
        }

        let live_rooms: HashSet<String> =
            self.invites.iter().map(|i| i.room_id.clone()).collect();
        self.accepted.retain(|room_id, _| live_rooms.contains(room_id));

        if removed > 0 {
            tracing::debug!(count = removed, "Swept ended invites");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invitee(id: &str) -> Invitee {
        Invitee {
            id: id.to_string(),
            name: id.to_uppercase(),
        }
    }

    #[test]
    fn test_one_to_one_room_id_is_symmetric() {
        assert_eq!(one_to_one_room_id("alice", "bob"), "alice_bob");
        assert_eq!(one_to_one_room_id("bob", "alice"), "alice_bob");
    }

    #[test]
    fn test_simultaneous_invites_converge_on_one_room() {
        let coordinator = CallInviteCoordinator::new();

        let from_alice = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let from_bob = coordinator
            .create_invite("bob", "Bob", &[invitee("alice")])
            .unwrap();

        assert_eq!(from_alice.room_id, from_bob.room_id);
        assert_eq!(from_alice.room_id, "alice_bob");
    }

    #[test]
    fn test_group_rooms_are_unique_per_invocation() {
        let coordinator = CallInviteCoordinator::new();

        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob"), invitee("carol")])
            .unwrap();

        assert!(creation.room_id.starts_with("alice_"));
        assert_ne!(creation.room_id, "alice_bob");
        assert_eq!(creation.invites.len(), 2);
        assert!(creation.invites.iter().all(|i| i.is_group));
        assert!(creation
            .invites
            .iter()
            .all(|i| i.room_id == creation.room_id));

        // Accepted-set pre-seeded with the caller.
        assert_eq!(coordinator.accepted_set(&creation.room_id), vec!["alice"]);
    }

    #[test]
    fn test_empty_invitee_list_rejected() {
        let coordinator = CallInviteCoordinator::new();
        assert!(coordinator.create_invite("alice", "Alice", &[]).is_none());
    }

    #[test]
    fn test_accept_moves_to_accepted_and_grows_accepted_set() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = &creation.invites[0].invite_id;

        let accepted = coordinator.accept(invite_id).unwrap();
        assert_eq!(accepted.status, InviteStatus::Accepted);
        assert_eq!(
            coordinator.accepted_set(&creation.room_id),
            vec!["alice", "bob"]
        );
    }

    #[test]
    fn test_late_accept_after_end_is_silent_noop() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = &creation.invites[0].invite_id;

        coordinator.end(invite_id).unwrap();
        assert!(coordinator.accept(invite_id).is_none());
        // Still ended; no backward transition.
        assert_eq!(
            coordinator.get(invite_id).unwrap().status,
            InviteStatus::Ended
        );
    }

    #[test]
    fn test_end_is_idempotent_and_transitions_once() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = &creation.invites[0].invite_id;

        assert!(coordinator.end(invite_id).is_some());
        assert!(coordinator.end(invite_id).is_none());
    }

    #[test]
    fn test_status_never_moves_backward() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = &creation.invites[0].invite_id;

        coordinator.accept(invite_id);
        coordinator.end(invite_id);

        // A stale expire sweep must not resurrect or re-end it.
        let expired = coordinator.expire_ringing(Duration::seconds(0));
        assert!(expired.is_empty());
        assert_eq!(
            coordinator.get(invite_id).unwrap().status,
            InviteStatus::Ended
        );
    }

    #[test]
    fn test_expire_skips_invite_accepted_before_sweep() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = &creation.invites[0].invite_id;

        // Bob answers just as the sweep's cutoff passes his record.
        coordinator.accept(invite_id);

        let expired = coordinator.expire_ringing(Duration::seconds(0));
        assert!(expired.is_empty());
        assert_eq!(
            coordinator.get(invite_id).unwrap().status,
            InviteStatus::Accepted
        );
    }

    #[test]
    fn test_group_partial_acceptance_scenario() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob"), invitee("carol")])
            .unwrap();

        let bob_invite = creation
            .invites
            .iter()
            .find(|i| i.invitee_id == "bob")
            .unwrap();
        let carol_invite = creation
            .invites
            .iter()
            .find(|i| i.invitee_id == "carol")
            .unwrap();

        coordinator.accept(&bob_invite.invite_id);
        assert_eq!(
            coordinator.accepted_set(&creation.room_id),
            vec!["alice", "bob"]
        );

        // Carol never answers; the ring timeout expires her record.
        let expired = coordinator.expire_ringing(Duration::seconds(0));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].invitee_id, "carol");
        assert_eq!(
            coordinator.get(&carol_invite.invite_id).unwrap().status,
            InviteStatus::Ended
        );
        // Bob's record is untouched.
        assert_eq!(
            coordinator.get(&bob_invite.invite_id).unwrap().status,
            InviteStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_subscribe_incoming_delivers_ringing_invites() {
        let coordinator = CallInviteCoordinator::new();
        let mut feed = coordinator.subscribe_incoming("bob");

        coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();

        let invite = feed.recv().await.unwrap();
        assert_eq!(invite.caller_id, "alice");
        assert_eq!(invite.status, InviteStatus::Ringing);
    }

    #[tokio::test]
    async fn test_cancelled_incoming_feed_receives_nothing() {
        let coordinator = CallInviteCoordinator::new();
        let feed = coordinator.subscribe_incoming("bob");
        drop(feed);
        coordinator.unsubscribe_incoming("bob");

        // Must not panic or deliver anywhere.
        coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        assert_eq!(coordinator.ringing_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_acceptance_observes_transitions() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = creation.invites[0].invite_id.clone();

        let mut status = coordinator.subscribe_acceptance(&invite_id).unwrap();
        assert_eq!(*status.borrow(), InviteStatus::Ringing);

        coordinator.accept(&invite_id);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), InviteStatus::Accepted);

        coordinator.end(&invite_id);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), InviteStatus::Ended);
    }

    #[test]
    fn test_find_live_pair() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();

        let found = coordinator.find_live_pair("alice", "bob").unwrap();
        assert_eq!(found.invite_id, creation.invites[0].invite_id);

        coordinator.end(&found.invite_id);
        assert!(coordinator.find_live_pair("alice", "bob").is_none());
    }

    #[test]
    fn test_sweep_ended_forgets_old_records() {
        let coordinator = CallInviteCoordinator::new();
        let creation = coordinator
            .create_invite("alice", "Alice", &[invitee("bob")])
            .unwrap();
        let invite_id = creation.invites[0].invite_id.clone();

        coordinator.end(&invite_id);
        let removed = coordinator.sweep_ended(Duration::seconds(0));
        assert_eq!(removed, 1);
        assert!(coordinator.get(&invite_id).is_none());
        assert!(coordinator.subscribe_acceptance(&invite_id).is_none());
        assert!(coordinator.accepted_set(&creation.room_id).is_empty());
    }
}

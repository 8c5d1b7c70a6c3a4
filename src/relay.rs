//! Signal relay.
//!
//! One enforcement point for the delivery contract, shared by both
//! transports: delivery set = current room members minus the sender,
//! per-(room, sender) sequence order, no self-echo, and stale-history
//! discard before a (re)join's subscription begins. Payloads pass
//! through opaque; the relay routes by envelope fields only.
//!
//! A room's members may sit on different transports (one side on the
//! push socket, the other polling), so every publish goes through both
//! mechanisms; each delivers to its own subscribers among the
//! recipients and ignores the rest.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::protocol::{SignalEnvelope, SignalKind};
use crate::rooms::{ConnId, RoomRegistry};
use crate::transport::{PollTransport, PushTransport, SignalTransport, Subscription};

/// Which delivery mechanism a joining handle subscribes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Push,
    Poll,
}

/// Router over both transports. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SignalRelay {
    rooms: RoomRegistry,
    push: PushTransport,
    poll: PollTransport,
    /// Next sequence number per (room id, sender participant id).
    /// Mutated under the entry, so a sender's sequence is total.
    seq: Arc<DashMap<(String, String), u64>>,
}

impl SignalRelay {
    pub fn new(rooms: RoomRegistry, push: PushTransport, poll: PollTransport) -> Self {
        Self {
            rooms,
            push,
            poll,
            seq: Arc::new(DashMap::new()),
        }
    }

    fn transports(&self) -> [&dyn SignalTransport; 2] {
        [&self.push, &self.poll]
    }

    /// Join a handle to a room over the chosen transport. Opens the
    /// subscription first (discarding anything buffered from a
    /// previous session) and only then registers membership, so every
    /// signal relayed after this returns is guaranteed delivered to
    /// the joiner.
    ///
    /// Returns the subscription and the membership snapshot for the
    /// joined-room acknowledgement. The snapshot never contains the
    /// joiner itself, so a re-join of the same room doesn't announce
    /// the client to itself.
    pub fn join(
        &self,
        room_id: &str,
        handle: ConnId,
        participant_id: &str,
        kind: TransportKind,
    ) -> (Subscription, Vec<ConnId>) {
        let subscription = match kind {
            TransportKind::Push => self.push.subscribe(room_id, handle, participant_id),
            TransportKind::Poll => self.poll.subscribe(room_id, handle, participant_id),
        };
        let existing = self.rooms.members_excluding(room_id, handle);
        self.rooms.join(room_id, handle);
        (subscription, existing)
    }

    /// Remove a handle from a room. Returns the remaining members.
    /// When this leave deletes the emptied room, its retained signal
    /// history and sequence counters go with it; nothing left to
    /// replay into a new session. The purge is keyed on the confirmed
    /// deletion, not on an empty membership snapshot, so a join that
    /// raced the leave keeps its fresh subscription.
    pub fn leave(&self, room_id: &str, handle: ConnId) -> Vec<ConnId> {
        for transport in self.transports() {
            transport.unsubscribe(room_id, handle);
        }
        let outcome = self.rooms.leave(room_id, handle);
        if outcome.deleted {
            self.purge_room(room_id);
        }
        outcome.remaining
    }

    /// Relay an opaque handshake payload to the other members of a
    /// room. Returns the handles it was delivered toward. Relaying
    /// into a dead room delivers to nobody; not an error, the sender
    /// may be racing a cleanup.
    pub fn relay(
        &self,
        room_id: &str,
        sender_handle: ConnId,
        sender_id: &str,
        kind: SignalKind,
        payload: String,
    ) -> Vec<ConnId> {
        let recipients = self.rooms.members_excluding(room_id, sender_handle);
        if recipients.is_empty() {
            tracing::debug!(
                room_id = room_id,
                from = sender_id,
                "Signal relayed into empty room, dropped"
            );
            return recipients;
        }

        let seq = {
            let mut counter = self
                .seq
                .entry((room_id.to_string(), sender_id.to_string()))
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let envelope = SignalEnvelope {
            room_id: room_id.to_string(),
            kind,
            payload,
            from: sender_id.to_string(),
            seq,
            sent_at: Utc::now(),
        };

        let mut delivered = 0;
        for transport in self.transports() {
            delivered += transport.publish(room_id, &envelope, &recipients);
        }
        self.rooms.touch(room_id);

        tracing::debug!(
            room_id = room_id,
            from = sender_id,
            seq = seq,
            recipients = recipients.len(),
            delivered = delivered,
            "Relayed signal"
        );

        recipients
    }

    /// Drop a room's retained history and sequence counters.
    pub fn purge_room(&self, room_id: &str) {
        for transport in self.transports() {
            transport.purge_room(room_id);
        }
        self.seq.retain(|(room, _), _| room != room_id);
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn relay() -> SignalRelay {
        SignalRelay::new(RoomRegistry::new(), PushTransport::new(), PollTransport::new())
    }

    fn receiver(sub: Subscription) -> mpsc::UnboundedReceiver<SignalEnvelope> {
        match sub {
            Subscription::Push(rx) => rx,
            Subscription::Poll { .. } => panic!("expected push subscription"),
        }
    }

    #[test]
    fn test_relay_delivers_to_members_minus_sender() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (alice_sub, _) = relay.join("r", alice, "alice", TransportKind::Push);
        let (bob_sub, existing) = relay.join("r", bob, "bob", TransportKind::Push);
        assert_eq!(existing, vec![alice]);

        let mut alice_rx = receiver(alice_sub);
        let mut bob_rx = receiver(bob_sub);

        let recipients = relay.relay("r", alice, "alice", SignalKind::Offer, "sdp".to_string());
        assert_eq!(recipients, vec![bob]);

        let received = bob_rx.try_recv().unwrap();
        assert_eq!(received.kind, SignalKind::Offer);
        assert_eq!(received.from, "alice");
        // Never echoed to the sender.
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_rejoin_membership_snapshot_excludes_self() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        relay.join("r", alice, "alice", TransportKind::Push);
        relay.join("r", bob, "bob", TransportKind::Push);

        // Re-joining the room alice is already in must not report
        // alice back to herself.
        let (_, existing) = relay.join("r", alice, "alice", TransportKind::Push);
        assert_eq!(existing, vec![bob]);
    }

    #[test]
    fn test_per_sender_sequence_is_monotone() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        relay.join("r", alice, "alice", TransportKind::Push);
        let (bob_sub, _) = relay.join("r", bob, "bob", TransportKind::Push);
        let mut bob_rx = receiver(bob_sub);

        relay.relay("r", alice, "alice", SignalKind::Offer, "o".to_string());
        relay.relay("r", alice, "alice", SignalKind::IceCandidate, "c1".to_string());
        relay.relay("r", alice, "alice", SignalKind::IceCandidate, "c2".to_string());

        let seqs: Vec<u64> = (0..3).map(|_| bob_rx.try_recv().unwrap().seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_sequences_are_independent_per_sender() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();

        relay.join("r", alice, "alice", TransportKind::Push);
        relay.join("r", bob, "bob", TransportKind::Push);
        let (carol_sub, _) = relay.join("r", carol, "carol", TransportKind::Push);
        let mut carol_rx = receiver(carol_sub);

        relay.relay("r", alice, "alice", SignalKind::Offer, "a1".to_string());
        relay.relay("r", bob, "bob", SignalKind::Offer, "b1".to_string());

        let first = carol_rx.try_recv().unwrap();
        let second = carol_rx.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 1);
        assert_ne!(first.from, second.from);
    }

    #[test]
    fn test_relay_into_dead_room_is_dropped() {
        let relay = relay();
        let ghost = Uuid::new_v4();
        let recipients = relay.relay("gone", ghost, "alice", SignalKind::Offer, "x".to_string());
        assert!(recipients.is_empty());
    }

    #[test]
    fn test_rejoin_does_not_replay_stale_handshake() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        relay.join("r", alice, "alice", TransportKind::Push);
        let (stale_sub, _) = relay.join("r", bob, "bob", TransportKind::Push);
        let _stale_rx = receiver(stale_sub);

        // Offer sent while bob's first subscription was live but unread.
        relay.relay("r", alice, "alice", SignalKind::Offer, "stale".to_string());

        // Bob re-joins: the new subscription starts clean.
        let (fresh_sub, _) = relay.join("r", bob, "bob", TransportKind::Push);
        let mut fresh_rx = receiver(fresh_sub);
        assert!(fresh_rx.try_recv().is_err());

        relay.relay("r", alice, "alice", SignalKind::Offer, "fresh".to_string());
        assert_eq!(fresh_rx.try_recv().unwrap().payload, "fresh");
    }

    #[test]
    fn test_leave_of_last_member_purges_sequence_state() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        relay.join("r", alice, "alice", TransportKind::Push);
        relay.join("r", bob, "bob", TransportKind::Push);
        relay.relay("r", alice, "alice", SignalKind::Offer, "o".to_string());

        relay.leave("r", bob);
        relay.leave("r", alice);
        assert!(!relay.rooms().is_live("r"));

        // A fresh session in the same room starts its sequence over.
        relay.join("r", alice, "alice", TransportKind::Push);
        let (bob_sub, _) = relay.join("r", bob, "bob", TransportKind::Push);
        let mut bob_rx = receiver(bob_sub);
        relay.relay("r", alice, "alice", SignalKind::Offer, "o2".to_string());
        assert_eq!(bob_rx.try_recv().unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_mixed_transport_room_delivers_across_mechanisms() {
        let relay = relay();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        // Alice pushes, bob polls; same room.
        let (alice_sub, _) = relay.join("r", alice, "alice", TransportKind::Push);
        let mut alice_rx = receiver(alice_sub);
        let (bob_sub, _) = relay.join("r", bob, "bob", TransportKind::Poll);
        let Subscription::Poll { .. } = bob_sub else {
            panic!("expected poll subscription");
        };

        relay.relay("r", alice, "alice", SignalKind::Offer, "sdp".to_string());

        let page = relay
            .poll
            .fetch(bob, None, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(page.signals.len(), 1);
        assert_eq!(page.signals[0].from, "alice");

        // And back: bob's answer reaches alice's push inbox.
        relay.relay("r", bob, "bob", SignalKind::Answer, "sdp".to_string());
        assert_eq!(alice_rx.try_recv().unwrap().kind, SignalKind::Answer);
    }
}

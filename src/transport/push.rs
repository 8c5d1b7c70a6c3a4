//! Push transport: immediate per-connection fan-out.
//!
//! Each subscribed handle owns an unbounded inbox channel. Publishing
//! sends the envelope into every recipient's inbox; the WebSocket
//! handler drains the inbox into the socket. Because each inbox is a
//! single FIFO channel, per-sender publish order is preserved all the
//! way to the wire.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{SignalTransport, Subscription};
use crate::protocol::SignalEnvelope;
use crate::rooms::ConnId;

struct Inbox {
    room_id: String,
    participant_id: String,
    sender: mpsc::UnboundedSender<SignalEnvelope>,
}

/// Fan-out delivery over per-connection channels. Cheap to clone.
#[derive(Clone, Default)]
pub struct PushTransport {
    inboxes: Arc<DashMap<ConnId, Inbox>>,
}

impl PushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open inboxes. Diagnostic only.
    pub fn inbox_count(&self) -> usize {
        self.inboxes.len()
    }
}

impl SignalTransport for PushTransport {
    fn subscribe(&self, room_id: &str, handle: ConnId, participant_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // Inserting replaces any prior inbox for this handle; its
        // receiver side goes dead and whatever was buffered there is
        // dropped, which is the stale-history discard for re-joins.
        self.inboxes.insert(
            handle,
            Inbox {
                room_id: room_id.to_string(),
                participant_id: participant_id.to_string(),
                sender: tx,
            },
        );

        Subscription::Push(rx)
    }

    fn unsubscribe(&self, room_id: &str, handle: ConnId) {
        // Only drop the inbox if it still belongs to this room; the
        // handle may have re-subscribed to another room already.
        self.inboxes
            .remove_if(&handle, |_, inbox| inbox.room_id == room_id);
    }

    fn publish(&self, room_id: &str, envelope: &SignalEnvelope, recipients: &[ConnId]) -> usize {
        let mut delivered = 0;
        for handle in recipients {
            let Some(inbox) = self.inboxes.get(handle) else {
                continue;
            };
            if inbox.room_id != room_id {
                continue;
            }
            // Self-echo guard on top of the relay's sender exclusion.
            if inbox.participant_id == envelope.from {
                continue;
            }
            if inbox.sender.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn purge_room(&self, room_id: &str) {
        self.inboxes.retain(|_, inbox| inbox.room_id != room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SignalKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn envelope(room: &str, from: &str, seq: u64, payload: &str) -> SignalEnvelope {
        SignalEnvelope {
            room_id: room.to_string(),
            kind: SignalKind::Offer,
            payload: payload.to_string(),
            from: from.to_string(),
            seq,
            sent_at: Utc::now(),
        }
    }

    fn receiver(sub: Subscription) -> mpsc::UnboundedReceiver<SignalEnvelope> {
        match sub {
            Subscription::Push(rx) => rx,
            Subscription::Poll { .. } => panic!("expected push subscription"),
        }
    }

    #[test]
    fn test_publish_delivers_to_recipients() {
        let transport = PushTransport::new();
        let bob = Uuid::new_v4();
        let mut rx = receiver(transport.subscribe("r", bob, "bob"));

        let n = transport.publish("r", &envelope("r", "alice", 1, "offer"), &[bob]);
        assert_eq!(n, 1);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.payload, "offer");
        assert_eq!(received.from, "alice");
    }

    #[test]
    fn test_publish_preserves_order() {
        let transport = PushTransport::new();
        let bob = Uuid::new_v4();
        let mut rx = receiver(transport.subscribe("r", bob, "bob"));

        for seq in 1..=3 {
            transport.publish("r", &envelope("r", "alice", seq, &format!("s{seq}")), &[bob]);
        }

        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
        assert_eq!(rx.try_recv().unwrap().seq, 3);
    }

    #[test]
    fn test_publish_filters_self_echo() {
        let transport = PushTransport::new();
        let alice = Uuid::new_v4();
        let mut rx = receiver(transport.subscribe("r", alice, "alice"));

        // Even when the sender's own handle ends up in the recipient
        // list, the from-tag keeps the echo out.
        let n = transport.publish("r", &envelope("r", "alice", 1, "offer"), &[alice]);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resubscribe_discards_buffered_signals() {
        let transport = PushTransport::new();
        let bob = Uuid::new_v4();
        let _stale = receiver(transport.subscribe("r", bob, "bob"));

        transport.publish("r", &envelope("r", "alice", 1, "stale_offer"), &[bob]);

        // Re-join: fresh subscription must not replay the stale offer.
        let mut rx = receiver(transport.subscribe("r", bob, "bob"));
        assert!(rx.try_recv().is_err());

        transport.publish("r", &envelope("r", "alice", 2, "fresh_offer"), &[bob]);
        assert_eq!(rx.try_recv().unwrap().payload, "fresh_offer");
    }

    #[test]
    fn test_unsubscribe_only_matches_current_room() {
        let transport = PushTransport::new();
        let bob = Uuid::new_v4();
        let _rx_old = receiver(transport.subscribe("r1", bob, "bob"));
        let mut rx_new = receiver(transport.subscribe("r2", bob, "bob"));

        // Stale unsubscribe for the old room must not tear down the
        // new subscription.
        transport.unsubscribe("r1", bob);
        transport.publish("r2", &envelope("r2", "alice", 1, "offer"), &[bob]);
        assert_eq!(rx_new.try_recv().unwrap().payload, "offer");

        transport.unsubscribe("r2", bob);
        assert_eq!(transport.inbox_count(), 0);
    }

    #[test]
    fn test_purge_room_drops_room_inboxes() {
        let transport = PushTransport::new();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let _rx1 = receiver(transport.subscribe("r1", bob, "bob"));
        let _rx2 = receiver(transport.subscribe("r2", carol, "carol"));

        transport.purge_room("r1");
        assert_eq!(transport.inbox_count(), 1);
        assert_eq!(transport.publish("r1", &envelope("r1", "alice", 1, "x"), &[bob]), 0);
        assert_eq!(transport.publish("r2", &envelope("r2", "alice", 1, "y"), &[carol]), 1);
    }
}

//! Poll transport: ordered per-room document log with live queries.
//!
//! Signals are appended to a per-room log and read back by cursor. A
//! subscriber's cursor starts at the log tail when it joins, so a
//! fresh subscription can never be handed history from before it; a
//! handshake from a prior, torn-down session is unreadable by design.
//! Live queries block on a per-room notifier instead of busy polling.
//!
//! There is no connection to detect disconnects with; liveness comes
//! from activity heartbeats (any append or fetch refreshes the
//! subscriber), and the reaper evicts subscribers that go quiet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;

use super::{SignalTransport, Subscription};
use crate::protocol::SignalEnvelope;
use crate::rooms::ConnId;

struct RoomLog {
    /// (cursor, envelope) in append order. Cursors are dense and
    /// monotone per room.
    docs: Vec<(u64, SignalEnvelope)>,
    next_cursor: u64,
    notify: Arc<Notify>,
}

impl RoomLog {
    fn new() -> Self {
        Self {
            docs: Vec::new(),
            next_cursor: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct PollSubscriber {
    room_id: String,
    participant_id: String,
    cursor: u64,
    /// The log tail at subscribe time. A client-supplied `after` can
    /// never rewind below this, so documents from before the
    /// subscription stay unreadable.
    floor: u64,
    last_seen: DateTime<Utc>,
}

/// One page of a live query.
#[derive(Debug, Serialize)]
pub struct SignalPage {
    pub signals: Vec<SignalEnvelope>,
    /// Pass back as `after` (or rely on the server-side cursor) to
    /// continue from here.
    pub cursor: u64,
}

/// A poll subscriber the reaper evicted for missing heartbeats.
#[derive(Debug)]
pub struct DeadSubscriber {
    pub handle: ConnId,
    pub room_id: String,
    pub participant_id: String,
}

/// Shared ordered document store, one log per room. Cheap to clone.
#[derive(Clone, Default)]
pub struct PollTransport {
    logs: Arc<DashMap<String, RoomLog>>,
    subscribers: Arc<DashMap<ConnId, PollSubscriber>>,
}

impl PollTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live query: documents after the subscriber's cursor, excluding
    /// its own, long-polling up to `wait` when none are pending. Also
    /// serves as the subscriber's heartbeat. Returns None for an
    /// unknown subscriber.
    ///
    /// `after` optionally rewinds the cursor first (client retry
    /// after a lost response), clamped to the subscription's starting
    /// point: a retry may replay this session's documents, never a
    /// prior session's.
    pub async fn fetch(
        &self,
        handle: ConnId,
        after: Option<u64>,
        wait: Duration,
    ) -> Option<SignalPage> {
        let deadline = tokio::time::Instant::now() + wait;

        let room_id = {
            let mut sub = self.subscribers.get_mut(&handle)?;
            sub.last_seen = Utc::now();
            if let Some(after) = after {
                sub.cursor = after.max(sub.floor);
            }
            sub.room_id.clone()
        };

        loop {
            let notify = self.logs.get(&room_id)?.notify.clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before snapshotting so an append
            // between the snapshot and the await still wakes us.
            notified.as_mut().enable();

            let page = self.read_page(handle, &room_id)?;
            if !page.signals.is_empty() {
                return Some(page);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Some(page);
            }
        }
    }

    fn read_page(&self, handle: ConnId, room_id: &str) -> Option<SignalPage> {
        let mut sub = self.subscribers.get_mut(&handle)?;
        let log = self.logs.get(room_id)?;

        let signals: Vec<SignalEnvelope> = log
            .docs
            .iter()
            .filter(|(cursor, doc)| *cursor >= sub.cursor && doc.from != sub.participant_id)
            .map(|(_, doc)| doc.clone())
            .collect();

        sub.cursor = log.next_cursor;
        sub.last_seen = Utc::now();
        Some(SignalPage {
            signals,
            cursor: log.next_cursor,
        })
    }

    /// Refresh a subscriber's heartbeat without reading (used by the
    /// append path).
    pub fn touch(&self, handle: ConnId) {
        if let Some(mut sub) = self.subscribers.get_mut(&handle) {
            sub.last_seen = Utc::now();
        }
    }

    /// Room and participant a subscriber is bound to.
    pub fn subscriber_info(&self, handle: ConnId) -> Option<(String, String)> {
        self.subscribers
            .get(&handle)
            .map(|s| (s.room_id.clone(), s.participant_id.clone()))
    }

    /// Total retained documents across all rooms.
    pub fn doc_count(&self) -> usize {
        self.logs.iter().map(|log| log.docs.len()).sum()
    }

    /// Number of live poll subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Evict subscribers whose last heartbeat predates `ttl`. Returns
    /// what was evicted so the caller can release their room slots.
    pub fn sweep_dead(&self, ttl: chrono::Duration) -> Vec<DeadSubscriber> {
        let cutoff = Utc::now() - ttl;

        let dead: Vec<ConnId> = self
            .subscribers
            .iter()
            .filter(|entry| entry.last_seen < cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::new();
        for handle in dead {
            // Recheck under removal: a heartbeat may have just landed.
            if let Some((_, sub)) = self
                .subscribers
                .remove_if(&handle, |_, sub| sub.last_seen < cutoff)
            {
                evicted.push(DeadSubscriber {
                    handle,
                    room_id: sub.room_id,
                    participant_id: sub.participant_id,
                });
            }
        }

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted dead poll subscribers");
        }
        evicted
    }

    /// Drop document logs for rooms no longer known to the registry,
    /// and trim each surviving log below its slowest subscriber's
    /// cursor. Keeps memory bounded across long calls.
    pub fn sweep_orphans(&self, live_room_ids: &[String]) -> usize {
        let mut dropped = 0;

        let orphans: Vec<String> = self
            .logs
            .iter()
            .filter(|log| !live_room_ids.contains(log.key()))
            .map(|log| log.key().clone())
            .collect();
        for room_id in orphans {
            if let Some((_, log)) = self.logs.remove(&room_id) {
                dropped += log.docs.len();
            }
        }

        // Collect per-room floors first; holding a log guard while
        // walking subscribers (or vice versa) invites lock inversion
        // against the read path.
        let mut floors: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        for sub in self.subscribers.iter() {
            floors
                .entry(sub.room_id.clone())
                .and_modify(|floor| *floor = (*floor).min(sub.cursor))
                .or_insert(sub.cursor);
        }
        for mut log in self.logs.iter_mut() {
            let before = log.docs.len();
            match floors.get(log.key()) {
                Some(floor) => log.docs.retain(|(cursor, _)| *cursor >= *floor),
                // No poll subscriber in this room; everything retained
                // is unreadable (a future subscriber starts at the
                // tail), so drop it.
                None => log.docs.clear(),
            }
            dropped += before - log.docs.len();
        }

        if dropped > 0 {
            tracing::debug!(count = dropped, "Purged orphaned signal documents");
        }
        dropped
    }
}

impl SignalTransport for PollTransport {
    fn subscribe(&self, room_id: &str, handle: ConnId, participant_id: &str) -> Subscription {
        let cursor = {
            let log = self
                .logs
                .entry(room_id.to_string())
                .or_insert_with(RoomLog::new);
            log.next_cursor
        };

        // Replaces any previous subscription for this handle; the
        // tail cursor makes prior history invisible to the re-join.
        self.subscribers.insert(
            handle,
            PollSubscriber {
                room_id: room_id.to_string(),
                participant_id: participant_id.to_string(),
                cursor,
                floor: cursor,
                last_seen: Utc::now(),
            },
        );

        Subscription::Poll { cursor }
    }

    fn unsubscribe(&self, room_id: &str, handle: ConnId) {
        self.subscribers
            .remove_if(&handle, |_, sub| sub.room_id == room_id);
    }

    fn publish(&self, room_id: &str, envelope: &SignalEnvelope, recipients: &[ConnId]) -> usize {
        let notify = {
            let mut log = self
                .logs
                .entry(room_id.to_string())
                .or_insert_with(RoomLog::new);
            let cursor = log.next_cursor;
            log.next_cursor += 1;
            log.docs.push((cursor, envelope.clone()));
            log.notify.clone()
        };
        notify.notify_waiters();

        recipients
            .iter()
            .filter(|handle| {
                self.subscribers
                    .get(handle)
                    .map(|s| s.room_id == room_id && s.participant_id != envelope.from)
                    .unwrap_or(false)
            })
            .count()
    }

    fn purge_room(&self, room_id: &str) {
        if let Some((_, log)) = self.logs.remove(room_id) {
            // Wake any in-flight live queries so they observe the
            // missing log and return instead of waiting out the clock.
            log.notify.notify_waiters();
        }
        self.subscribers.retain(|_, sub| sub.room_id != room_id);
    }
}

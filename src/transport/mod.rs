//! Delivery transports.
//!
//! Two delivery mechanisms carry the same logical signal protocol: a
//! push channel (per-connection fan-out over the WebSocket) and a
//! poll/subscribe channel (ordered per-room document log with live
//! queries). Both sit behind one trait so the relay enforces the
//! ordering, echo-suppression, and history-purge contracts in exactly
//! one place regardless of mechanism.

mod poll;
mod push;

pub use poll::{PollTransport, SignalPage};
pub use push::PushTransport;

use tokio::sync::mpsc;

use crate::protocol::SignalEnvelope;
use crate::rooms::ConnId;

/// What a subscriber gets back when its room subscription opens.
pub enum Subscription {
    /// Push: a live stream. Dropping the receiver cancels delivery;
    /// any signals buffered for a previous subscription of the same
    /// handle were discarded when this one replaced it.
    Push(mpsc::UnboundedReceiver<SignalEnvelope>),

    /// Poll: a cursor positioned at the current document tail, so the
    /// subscriber can never read history from before it joined.
    Poll { cursor: u64 },
}

/// A signal delivery mechanism.
///
/// Implementations must tag nothing and interpret nothing; envelopes
/// arrive fully formed from the relay, already carrying sender and
/// sequence number. The transport's only jobs are delivery in the
/// order published and discarding stale history when asked.
pub trait SignalTransport: Send + Sync + 'static {
    /// Open (or re-open) a handle's subscription to a room. Replaces
    /// any previous subscription for the handle, discarding whatever
    /// that subscription had pending.
    fn subscribe(&self, room_id: &str, handle: ConnId, participant_id: &str) -> Subscription;

    /// Close a handle's subscription to a room. No-op if absent or if
    /// the handle has since subscribed elsewhere.
    fn unsubscribe(&self, room_id: &str, handle: ConnId);

    /// Deliver an envelope to the given recipients. Returns how many
    /// recipients it was handed to. Recipients are already
    /// sender-excluded by the relay; implementations additionally
    /// filter by `envelope.from` in case their mechanism would
    /// otherwise echo.
    fn publish(&self, room_id: &str, envelope: &SignalEnvelope, recipients: &[ConnId]) -> usize;

    /// Drop all retained signal history for a room.
    fn purge_room(&self, room_id: &str);
}

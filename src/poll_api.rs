//! HTTP polling transport surface.
//!
//! The poll transport serves clients that cannot hold a WebSocket
//! open: they join a room, append signals with POSTs, and read new
//! signals with a long-poll GET that parks on the room's notifier
//! until a document lands or the wait expires. Liveness comes from
//! the requests themselves; a subscriber that stops polling is swept
//! by the reaper.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{ServerMessage, SignalKind};
use crate::relay::TransportKind;
use crate::rooms::ConnId;
use crate::state::RelayState;
use crate::transport::Subscription;

/// Longest a fetch is allowed to park, whatever the client asks for.
const MAX_WAIT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub participant_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub subscriber_id: ConnId,
    pub cursor: u64,
    pub participants: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    pub subscriber_id: ConnId,
}

#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub subscriber_id: ConnId,
    pub kind: SignalKind,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct FetchParams {
    pub subscriber_id: ConnId,
    pub after: Option<u64>,
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PairQuery {
    pub caller_id: String,
    pub invitee_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody { error: message.to_string() }),
    )
}

/// POST /poll/rooms/{room_id}/join
///
/// Mints a subscriber handle bound to this room. The returned cursor
/// sits at the log tail, so only signals relayed after the join are
/// ever visible to this subscriber.
pub async fn join_room(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    if req.participant_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: "participant_id must not be empty".to_string() }),
        )
            .into_response();
    }

    let handle: ConnId = Uuid::new_v4();
    state.presence.register(handle, &req.participant_id, &req.display_name);
    state.presence.attach(handle, &room_id);

    let (subscription, existing) =
        state.relay.join(&room_id, handle, &req.participant_id, TransportKind::Poll);
    let Subscription::Poll { cursor } = subscription else {
        // Poll joins always yield a cursor subscription.
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody { error: "subscription mismatch".to_string() }),
        )
            .into_response();
    };

    state.notify_handles(
        &existing,
        ServerMessage::ParticipantJoined {
            room_id: room_id.clone(),
            participant_id: req.participant_id.clone(),
        },
    );

    tracing::info!(
        room_id = room_id.as_str(),
        participant_id = req.participant_id.as_str(),
        subscriber_id = %handle,
        "Poll subscriber joined room"
    );

    Json(JoinResponse {
        subscriber_id: handle,
        cursor,
        participants: state.presence.participant_ids(&existing),
    })
    .into_response()
}

/// POST /poll/rooms/{room_id}/leave
///
/// Graceful departure. An ungraceful one (the client just stops
/// polling) lands in the same teardown via the reaper's dead-subscriber
/// sweep.
pub async fn leave_room(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(req): Json<LeaveRequest>,
) -> impl IntoResponse {
    let Some(info) = state.presence.on_disconnect(req.subscriber_id) else {
        return not_found("unknown subscriber").into_response();
    };

    let remaining = state.relay.leave(&room_id, req.subscriber_id);
    state.notify_handles(
        &remaining,
        ServerMessage::ParticipantLeft {
            room_id,
            participant_id: info.participant_id,
        },
    );

    StatusCode::NO_CONTENT.into_response()
}

/// POST /poll/rooms/{room_id}/signals
///
/// Appends a signal to the room log on behalf of a subscriber. The
/// write doubles as a liveness heartbeat.
pub async fn append_signal(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(req): Json<AppendRequest>,
) -> impl IntoResponse {
    let Some((subscribed_room, participant_id)) = state.poll.subscriber_info(req.subscriber_id)
    else {
        return not_found("unknown subscriber").into_response();
    };
    if subscribed_room != room_id {
        return not_found("subscriber is not in this room").into_response();
    }

    state.poll.touch(req.subscriber_id);
    state
        .relay
        .relay(&room_id, req.subscriber_id, &participant_id, req.kind, req.payload);

    StatusCode::ACCEPTED.into_response()
}

/// GET /poll/rooms/{room_id}/signals?subscriber_id&after&wait_ms
///
/// Live query: returns immediately when signals past the cursor exist,
/// otherwise parks until one arrives or the wait elapses. An empty
/// page with an unchanged cursor is a normal timeout, not an error.
pub async fn fetch_signals(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Query(params): Query<FetchParams>,
) -> impl IntoResponse {
    match state.poll.subscriber_info(params.subscriber_id) {
        Some((subscribed_room, _)) if subscribed_room == room_id => {}
        _ => return not_found("unknown subscriber").into_response(),
    }

    state.poll.touch(params.subscriber_id);

    let wait = Duration::from_millis(params.wait_ms.unwrap_or(0).min(MAX_WAIT_MS));
    match state.poll.fetch(params.subscriber_id, params.after, wait).await {
        Some(page) => Json(page).into_response(),
        // The subscriber was swept or the room was purged mid-wait.
        None => not_found("unknown subscriber").into_response(),
    }
}

/// GET /poll/invites?caller_id&invitee_id
///
/// Looks up the live invite between a caller and callee, so a polling
/// client can recover the invite id (and with it the room) after losing
/// the create response. Ended invites never match.
pub async fn pair_invite(
    State(state): State<RelayState>,
    Query(query): Query<PairQuery>,
) -> impl IntoResponse {
    match state.invites.find_live_pair(&query.caller_id, &query.invitee_id) {
        Some(invite) => Json(invite).into_response(),
        None => not_found("no live invite for this pair").into_response(),
    }
}

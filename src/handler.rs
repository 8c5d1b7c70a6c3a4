//! WebSocket connection handler.
//!
//! Runs one push-channel connection: waits for registration, spawns
//! the outbound sender task and the incoming-invite feed, dispatches
//! client messages through the relay/coordinator, and tears everything
//! down on disconnect; an ungraceful drop is just an implicit leave.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{CallInvite, ClientMessage, InviteStatus, ServerMessage};
use crate::relay::TransportKind;
use crate::rooms::ConnId;
use crate::state::RelayState;
use crate::transport::Subscription;

/// Handle a single WebSocket connection for its whole lifetime:
/// 1. Waits for a `Register` message binding the connection to a
///    participant
/// 2. Spawns a sender task for outbound messages and a feed task for
///    incoming invites
/// 3. Processes messages until the connection closes
/// 4. Cleans up presence, room membership, and subscriptions
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound channel for this client.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let (participant_id, display_name) = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Register { participant_id, display_name }) => {
                        if participant_id.is_empty() {
                            let err = ServerMessage::Error {
                                message: "participant_id must not be empty".to_string(),
                            };
                            if let Ok(json) = serde_json::to_string(&err) {
                                let _ = ws_sender.send(Message::Text(json)).await;
                            }
                            continue;
                        }

                        let ack = ServerMessage::Registered {
                            participant_id: participant_id.clone(),
                        };
                        match serde_json::to_string(&ack) {
                            Ok(json) => {
                                if ws_sender.send(Message::Text(json)).await.is_err() {
                                    return; // Connection closed
                                }
                            }
                            Err(_) => return,
                        }

                        break (participant_id, display_name);
                    }
                    Ok(ClientMessage::Ping) => {
                        if let Ok(json) = serde_json::to_string(&ServerMessage::Pong) {
                            let _ = ws_sender.send(Message::Text(json)).await;
                        }
                    }
                    Ok(_) => {
                        let err = ServerMessage::Error {
                            message: "Must register before sending other messages".to_string(),
                        };
                        if let Ok(json) = serde_json::to_string(&err) {
                            let _ = ws_sender.send(Message::Text(json)).await;
                        }
                    }
                    Err(e) => {
                        // Malformed message: dropped, logged, no error
                        // surfaced to the sender.
                        tracing::warn!(error = %e, "Dropped unparseable message before register");
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Connection closed before registration
            }
            _ => continue,
        }
    };

    // ── Step 2: Register Connection ───────────────────────────────────────

    let handle: ConnId = Uuid::new_v4();
    state.presence.register(handle, &participant_id, &display_name);
    state.register_client(&participant_id, tx.clone());
    tracing::info!(
        handle = %handle,
        participant_id = participant_id.as_str(),
        "WebSocket registered"
    );

    // ── Step 3: Spawn Sender and Invite Feed Tasks ────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server message");
                }
            }
        }
    });

    // Live feed of invites ringing for this participant. Aborting the
    // task on disconnect drops the receiver, which is the cancellation;
    // nothing is delivered to this connection afterwards.
    let invite_task = {
        let mut feed = state.invites.subscribe_incoming(&participant_id);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(invite) = feed.recv().await {
                if tx.send(ServerMessage::IncomingInvite { invite }).is_err() {
                    break;
                }
            }
        })
    };

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(&state, handle, &participant_id, client_msg);
                    }
                    Err(e) => {
                        // Malformed message (missing fields, unknown
                        // signal kind, ...): dropped and logged.
                        tracing::warn!(
                            participant_id = participant_id.as_str(),
                            error = %e,
                            "Dropped unparseable client message"
                        );
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(
                    participant_id = participant_id.as_str(),
                    "Client sent close frame"
                );
                break;
            }
            Err(e) => {
                tracing::warn!(
                    participant_id = participant_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong; ignore
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    disconnect_cleanup(&state, handle, &participant_id, &tx);
    invite_task.abort();
    sender_task.abort();
    tracing::info!(
        handle = %handle,
        participant_id = participant_id.as_str(),
        "WebSocket disconnected"
    );
}

/// Tear down everything a connection held. The presence removal is
/// exactly-once, so a disconnect racing another cleanup path releases
/// the room slot and notifies the remainder on exactly one of them.
fn disconnect_cleanup(state: &RelayState, handle: ConnId, participant_id: &str, tx: &crate::state::ClientSender) {
    state.unregister_client(participant_id, tx);

    let Some(info) = state.presence.on_disconnect(handle) else {
        return;
    };

    if let Some(attachment) = info.attachment {
        let remaining = state.relay.leave(&attachment.room_id, handle);
        state.notify_handles(
            &remaining,
            ServerMessage::ParticipantLeft {
                room_id: attachment.room_id,
                participant_id: info.participant_id,
            },
        );
    }
}

/// Handle a parsed client message.
fn handle_client_message(
    state: &RelayState,
    handle: ConnId,
    participant_id: &str,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Register { .. } => {
            state.send_to_participant(
                participant_id,
                ServerMessage::Error {
                    message: "Already registered".to_string(),
                },
            );
        }

        ClientMessage::JoinRoom { room_id } => {
            handle_join_room(state, handle, participant_id, &room_id);
        }

        ClientMessage::LeaveRoom { room_id } => {
            handle_leave_room(state, handle, participant_id, &room_id);
        }

        ClientMessage::Signal { room_id, kind, payload } => {
            // Relaying requires membership; a signal from outside the
            // room is a protocol-state error, not a malformed message.
            if !state.rooms.members(&room_id).contains(&handle) {
                state.send_to_participant(
                    participant_id,
                    ServerMessage::Error {
                        message: format!("Not a member of room '{room_id}'"),
                    },
                );
                return;
            }
            state.relay.relay(&room_id, handle, participant_id, kind, payload);
        }

        ClientMessage::CreateInvite { invitees } => {
            let caller_name = state
                .presence
                .display_name(handle)
                .unwrap_or_default();

            let Some(creation) =
                state.invites.create_invite(participant_id, &caller_name, &invitees)
            else {
                tracing::warn!(
                    participant_id = participant_id,
                    "Dropped invite with no invitees"
                );
                return;
            };

            for invite in &creation.invites {
                spawn_invite_watcher(state.clone(), invite.clone());
            }

            state.send_to_participant(
                participant_id,
                ServerMessage::InviteCreated {
                    room_id: creation.room_id,
                    invite_ids: creation
                        .invites
                        .iter()
                        .map(|i| i.invite_id.clone())
                        .collect(),
                },
            );
        }

        ClientMessage::AcceptInvite { invite_id } => {
            // A late accept after timeout/decline is not an error;
            // the coordinator ignores it and no status fires.
            state.invites.accept(&invite_id);
        }

        ClientMessage::EndInvite { invite_id } => {
            state.invites.end(&invite_id);
        }

        ClientMessage::Ping => {
            state.send_to_participant(participant_id, ServerMessage::Pong);
        }
    }
}

// ── Room Handlers ─────────────────────────────────────────────────────────────

/// Join a room over the push transport. A connection is in at most one
/// room, so joining implicitly leaves the previous one.
fn handle_join_room(state: &RelayState, handle: ConnId, participant_id: &str, room_id: &str) {
    // Implicit leave of the previous room, with notification.
    if let Some(previous) = state.presence.attach(handle, room_id) {
        if previous.room_id != room_id {
            let remaining = state.relay.leave(&previous.room_id, handle);
            state.notify_handles(
                &remaining,
                ServerMessage::ParticipantLeft {
                    room_id: previous.room_id,
                    participant_id: participant_id.to_string(),
                },
            );
        }
    }

    let (subscription, existing) =
        state.relay.join(room_id, handle, participant_id, TransportKind::Push);

    // Pump relayed signals into this client's outbound channel. The
    // pump ends when the subscription is replaced or unsubscribed (the
    // inbox sender drops), so no signal fires after a leave.
    if let Subscription::Push(mut signals) = subscription {
        let pump_state = state.clone();
        let pump_participant = participant_id.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = signals.recv().await {
                if !pump_state.send_to_participant(&pump_participant, ServerMessage::Signal(envelope)) {
                    break;
                }
            }
        });
    }

    state.notify_handles(
        &existing,
        ServerMessage::ParticipantJoined {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        },
    );

    state.send_to_participant(
        participant_id,
        ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
            participants: state.presence.participant_ids(&existing),
        },
    );
}

/// Leave a room and notify whoever remains. Leaving a room the handle
/// isn't in (or that no longer exists) is a no-op.
fn handle_leave_room(state: &RelayState, handle: ConnId, participant_id: &str, room_id: &str) {
    if state.presence.detach(handle, room_id).is_none() {
        // Stale leave; the handle already moved on or never joined.
        return;
    }

    let remaining = state.relay.leave(room_id, handle);
    state.notify_handles(
        &remaining,
        ServerMessage::ParticipantLeft {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        },
    );
}

// ── Invite Status Watcher ─────────────────────────────────────────────────────

/// Forward an invite's status transitions to its caller and invitee
/// until it ends. Ring-timeout expiry from the reaper flows through
/// the same watch, so clients stop waiting the moment they observe
/// `ended`; no polling.
fn spawn_invite_watcher(state: RelayState, invite: CallInvite) {
    let Some(mut status_rx) = state.invites.subscribe_acceptance(&invite.invite_id) else {
        return;
    };

    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            let message = ServerMessage::InviteStatus {
                invite_id: invite.invite_id.clone(),
                room_id: invite.room_id.clone(),
                status,
                accepted: state.invites.accepted_set(&invite.room_id),
            };

            state.send_to_participant(&invite.caller_id, message.clone());
            state.send_to_participant(&invite.invitee_id, message);

            if status == InviteStatus::Ended {
                break;
            }
        }
    });
}

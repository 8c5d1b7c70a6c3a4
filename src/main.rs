//! Parley Relay Server
//!
//! A lightweight signaling and call-coordination server for P2P
//! audio/video calls:
//!
//! 1. **Signaling relay**: Forward SDP offers/answers and ICE
//!    candidates between call participants so peers can establish a
//!    direct WebRTC connection.
//!
//! 2. **Call invites**: Ring one or many invitees, track who accepted,
//!    and push every status change to both sides of each invite.
//!
//! 3. **Two transports**: A push channel over WebSocket and a poll
//!    channel over HTTP long-poll, relaying into the same rooms so a
//!    WebSocket caller can reach a polling callee.
//!
//! **Privacy**: The relay never inspects signal payloads. Session
//! descriptions and candidates pass through as opaque strings.

mod handler;
mod invites;
mod poll_api;
mod presence;
mod protocol;
mod reaper;
mod relay;
mod rooms;
mod state;
mod transport;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley-relay", version, about = "Parley call signaling server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// Seconds an invite may ring before it expires
    #[arg(long, default_value_t = 45, env = "RING_TIMEOUT_SECS")]
    ring_timeout_secs: i64,

    /// Seconds an empty room may idle before the reaper deletes it
    #[arg(long, default_value_t = 300, env = "ROOM_IDLE_SECS")]
    room_idle_secs: i64,

    /// Seconds an ended invite is retained for late status queries
    #[arg(long, default_value_t = 600, env = "INVITE_RETENTION_SECS")]
    invite_retention_secs: i64,

    /// Seconds a poll subscriber may go without a request before it is
    /// considered dead
    #[arg(long, default_value_t = 60, env = "POLL_SUBSCRIBER_TTL_SECS")]
    poll_subscriber_ttl_secs: i64,

    /// Reaper sweep interval in seconds
    #[arg(long, default_value_t = 120, env = "REAPER_INTERVAL_SECS")]
    reaper_interval_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        ring_timeout_secs: args.ring_timeout_secs,
        room_idle_secs: args.room_idle_secs,
        invite_retention_secs: args.invite_retention_secs,
        poll_subscriber_ttl_secs: args.poll_subscriber_ttl_secs,
        reaper_interval_secs: args.reaper_interval_secs,
    };

    let state = RelayState::new(config);

    reaper::spawn(state.clone());

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/poll/rooms/:room_id/join", post(poll_api::join_room))
        .route("/poll/rooms/:room_id/leave", post(poll_api::leave_room))
        .route(
            "/poll/rooms/:room_id/signals",
            post(poll_api::append_signal).get(poll_api::fetch_signals),
        )
        .route("/poll/invites", get(poll_api::pair_invite))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Parley relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for push-channel clients.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "parley-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "rooms": state.rooms.room_count(),
        "connections": state.presence.count(),
        "push_clients": state.client_count(),
        "poll_subscribers": state.poll.subscriber_count(),
        "poll_documents": state.poll.doc_count(),
        "ringing_invites": state.invites.ringing_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! WebSocket server handlers using Axum.
//!
//! Two channels share one connection loop:
//! - `/ws`: global canvas viewers, plain-text `ping` → `pong`.
//! - `/ws/game/{game_id}?user_id=N`: the two participants of a duel.

use crate::api;
use crate::protocol::{DuelClientMessage, CANVAS_PING, CANVAS_PONG};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use realtime::{BroadcastEvent, Connection, Scope, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Transport-level keepalive; idle connections are never closed.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Create the HTTP router: WebSocket channels, health and the JSON API.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(canvas_ws_handler))
        .route("/ws/game/{game_id}", get(duel_ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    scopes: usize,
    relays: usize,
    queue_waiting: Option<usize>,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.connection_count(),
        scopes: state.registry.scope_count(),
        relays: state.bus.relay_count(),
        queue_waiting: state.matchmaking.len().await.ok(),
    })
}

/// What a socket is attached to.
#[derive(Debug, Clone, Copy)]
enum Channel {
    Canvas,
    Duel { game_id: SessionId, user_id: UserId },
}

impl Channel {
    fn scope(&self) -> Scope {
        match self {
            Channel::Canvas => Scope::Canvas,
            Channel::Duel { game_id, .. } => Scope::Duel(*game_id),
        }
    }

    fn user_id(&self) -> Option<UserId> {
        match self {
            Channel::Canvas => None,
            Channel::Duel { user_id, .. } => Some(*user_id),
        }
    }
}

/// Canvas channel upgrade handler.
async fn canvas_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state, Channel::Canvas))
}

#[derive(Debug, Deserialize)]
pub struct DuelParams {
    pub user_id: Option<UserId>,
}

/// Duel channel upgrade handler.
///
/// The upgrade is always accepted; an invalid request is answered with a
/// policy-violation close frame, which browsers can observe.
async fn duel_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<SessionId>,
    Query(params): Query<DuelParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match authorize_duel(&state, game_id, params.user_id).await {
            Ok(user_id) => handle_socket(socket, state, Channel::Duel { game_id, user_id }).await,
            Err(reason) => reject_socket(socket, game_id, reason).await,
        }
    })
}

/// Confirm the game exists and the user plays in it.
async fn authorize_duel(
    state: &AppState,
    game_id: SessionId,
    user_id: Option<UserId>,
) -> std::result::Result<UserId, &'static str> {
    let user_id = match user_id {
        Some(id) if id != 0 => id,
        _ => return Err("user_id is required"),
    };
    match state.engine.get(game_id).await {
        Ok(game) if game.is_participant(user_id) => Ok(user_id),
        Ok(_) => Err("not a participant of this game"),
        Err(game::DuelError::NotFound(_)) => Err("game not found"),
        Err(e) => {
            warn!("Failed to load game {} for socket: {}", game_id, e);
            Err("game unavailable")
        }
    }
}

async fn reject_socket(mut socket: WebSocket, game_id: SessionId, reason: &'static str) {
    counter!("gateway_rejected_sockets_total").increment(1);
    info!("Rejecting duel socket for game {}: {}", game_id, reason);
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, channel: Channel) {
    let scope = channel.scope();
    let (connection, rx) = Connection::channel(channel.user_id());
    let connection_id = connection.id;

    state.registry.register(scope, connection.clone());
    if let Err(e) = state.bus.attach(scope).await {
        // Local publishes still reach this socket once the broker recovers.
        warn!("Could not start relay for {}: {}", scope, e);
    }
    counter!("gateway_connections_total", "channel" => channel_label(&channel)).increment(1);
    info!("Connection {} opened on {}", connection_id, scope);

    if let Channel::Duel { game_id, user_id } = channel {
        publish(
            &state,
            scope,
            BroadcastEvent::PlayerConnected { user_id, game_id },
            Some(connection_id),
        )
        .await;
    }

    serve(socket, &state, channel, &connection, rx).await;

    state.registry.unregister(scope, &connection_id);
    if let Channel::Duel { game_id, user_id } = channel {
        publish(
            &state,
            scope,
            BroadcastEvent::PlayerDisconnected { user_id, game_id },
            None,
        )
        .await;
    }
    state.bus.detach(scope);

    counter!("gateway_disconnections_total", "channel" => channel_label(&channel)).increment(1);
    info!("Connection {} closed on {}", connection_id, scope);
}

/// Pump one socket until the peer leaves or the registry evicts it.
async fn serve(
    socket: WebSocket,
    state: &Arc<AppState>,
    channel: Channel,
    connection: &Arc<Connection>,
    mut rx: mpsc::Receiver<Message>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward queued messages from the registry to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = connection.evicted() => {
                info!("Connection {} evicted after a failed send", connection.id);
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(state, channel, connection, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pongs and binary frames carry nothing for us.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", connection.id, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                let _ = connection.try_send(Message::Ping(vec![].into()));
            }
        }
    }

    send_task.abort();
}

async fn handle_text(
    state: &Arc<AppState>,
    channel: Channel,
    connection: &Arc<Connection>,
    text: &str,
) {
    match channel {
        Channel::Canvas => {
            if text == CANVAS_PING {
                connection.try_send(Message::Text(CANVAS_PONG.into()));
            }
        }
        Channel::Duel { user_id, .. } => {
            let Some(msg) = DuelClientMessage::parse(text) else {
                debug!("Ignoring malformed duel message from {}", connection.id);
                return;
            };
            match msg.into_relay_event(user_id) {
                Some(event) => {
                    publish(state, channel.scope(), event, Some(connection.id)).await;
                }
                None => {
                    connection.send_event(&BroadcastEvent::Pong);
                }
            }
        }
    }
}

async fn publish(
    state: &AppState,
    scope: Scope,
    event: BroadcastEvent,
    exclude: Option<realtime::ConnectionId>,
) {
    let kind = event.kind();
    if let Err(e) = state.bus.publish(scope, event, exclude).await {
        warn!("Failed to publish {} on {}: {}", kind, scope, e);
    }
}

fn channel_label(channel: &Channel) -> &'static str {
    match channel {
        Channel::Canvas => "canvas",
        Channel::Duel { .. } => "duel",
    }
}

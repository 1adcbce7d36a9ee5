//! WebSocket gateway.
//!
//! One axum route upgrades clients onto the JSON frame protocol. A missing
//! or wrong bearer token (query `token` or `Authorization: Bearer`) closes
//! the socket with policy code 1008 right after the upgrade. Each socket
//! task owns its client's state: inbound frames dispatch through the
//! orchestrator, outbound envelopes drain from the client's channel, and a
//! ping/pong cycle enforces liveness with a recent-activity exemption.

pub mod connection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::Bridge;
use crate::protocol::ServerEnvelope;
use connection::ClientHandle;

/// Clients with inbound activity this recent skip the pong requirement, so
/// a busy client under load is not flapped off.
const ACTIVITY_EXEMPTION: Duration = Duration::from_secs(30);

/// Build the gateway router.
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(bridge)
        .layer(CorsLayer::permissive())
}

async fn health(State(bridge): State<Arc<Bridge>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": bridge.sessions.session_count(),
        "clients": bridge.clients.len(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(bridge): State<Arc<Bridge>>,
) -> Response {
    let authorized = check_auth(bridge.config.auth_token.as_deref(), &params, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, bridge, authorized))
}

/// Token check: query parameter `token` or `Authorization: Bearer <t>`.
fn check_auth(
    expected: Option<&str>,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    if params.get("token").map(String::as_str) == Some(expected) {
        return true;
    }
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

async fn handle_socket(mut socket: WebSocket, bridge: Arc<Bridge>, authorized: bool) {
    if !authorized {
        warn!("unauthenticated connection rejected");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    }

    let client_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let client = Arc::new(ClientHandle::new(client_id.clone(), outbound_tx));
    bridge.clients.register(client.clone());
    info!(client = %client_id, "client connected");

    client.send(ServerEnvelope::response(
        None,
        bridge.welcome(&client_id),
    ));

    // Test mode keeps the ping timer effectively off.
    let ping_interval = if bridge.config.test_mode {
        Duration::from_secs(24 * 60 * 60)
    } else {
        bridge.config.ping_interval()
    };
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        // Dispatch off the socket task so a slow handler
                        // (e.g. a 30s ask) cannot starve pings.
                        let bridge = bridge.clone();
                        let client = client.clone();
                        tokio::spawn(async move {
                            bridge.handle_frame(&client, &text).await;
                        });
                    }
                    Some(Ok(Message::Pong(_))) => {
                        client.mark_alive();
                        client.touch();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(error)) => {
                        debug!(client = %client_id, "socket receive error: {error}");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => match serde_json::to_string(&envelope) {
                        Ok(frame) => {
                            if socket.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(client = %client_id, "failed to encode frame: {error}");
                        }
                    },
                    None => break,
                }
            }
            _ = ping.tick() => {
                // A client that missed the previous cycle's pong is
                // terminated, unless it showed other activity recently.
                if !client.is_alive() && !client.recently_active(ACTIVITY_EXEMPTION) {
                    info!(client = %client_id, "liveness check failed, terminating");
                    break;
                }
                client.mark_not_alive();
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Sessions continue in the background; only client state is released.
    bridge.clients.remove(&client_id);
    info!(client = %client_id, "client disconnected");
}

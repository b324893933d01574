//! ==============================================================================
//! ws.rs - websocket sessions
//! ==============================================================================
//!
//! purpose:
//!     the two socket endpoints on the websocket port:
//!
//! ```text
//!     /ws/device  the controller. claims the device link on connect; a second
//!                 controller gets a rejection notice and is closed.
//!     /           dashboard observers. subscribed to the systemInfo digest.
//!                 an observer that sends {"type":"esp32"} is promoted to
//!                 controller through the same claim. this is where the
//!                 dashboard and the ESP32 firmware connect. /ws and any
//!                 other path behave the same.
//! ```
//!
//! session loop (linked):
//!
//! ```text
//!     ┌──────────────────────┐       ┌──────────────────────┐
//!     │ lease.next_command() │──────▶│ socket.send(command) │
//!     └──────────────────────┘       └──────────────────────┘
//!     ┌──────────────────────┐       ┌──────────────────────┐
//!     │ socket.recv()        │──────▶│ parse → state.ingest │
//!     └──────────────────────┘       └──────────────────────┘
//! ```
//!
//! ```text
//!     frames are handled one at a time, so history order is arrival order.
//!     the lease is dropped when the loop ends, which puts the link back to Idle.
//! ```
//!
//! ==============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use std::net::SocketAddr;

use crate::broadcast::system_info_frame;
use crate::domain::NOTE_DEVICE;
use crate::error::LinkError;
use crate::link::{parse_frame, InboundFrame, LinkLease};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/device", get(device_handler))
        .route("/", get(observer_handler))
        .route("/ws", get(observer_handler))
        .fallback(observer_handler)
        .with_state(state)
}

async fn device_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| device_session(socket, state, peer))
}

async fn observer_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observer_session(socket, state, peer))
}

// ==============================================================================
// controller
// ==============================================================================

async fn device_session(socket: WebSocket, state: AppState, peer: SocketAddr) {
    match state.link.claim() {
        Ok(lease) => run_linked(socket, state, lease, peer).await,
        Err(e) => reject(socket, e, peer).await,
    }
}

/// tell a would-be second controller why, then close
async fn reject(mut socket: WebSocket, reason: LinkError, peer: SocketAddr) {
    tracing::warn!(%peer, "rejecting controller connection: {reason}");
    let notice = json!({ "message": reason.to_string() }).to_string();
    if socket.send(Message::Text(notice)).await.is_ok() {
        let _ = socket.send(Message::Close(None)).await;
    }
}

async fn run_linked(mut socket: WebSocket, state: AppState, mut lease: LinkLease, peer: SocketAddr) {
    tracing::info!(%peer, link = lease.id(), "controller session started");

    loop {
        tokio::select! {
            command = lease.next_command() => {
                let Some(command) = command else { break };
                let frame = match serde_json::to_string(&command) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("failed to encode device command: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_device_text(&state, &text).await,
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => handle_device_text(&state, text).await,
                        Err(_) => tracing::warn!(%peer, "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(%peer, "controller socket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {} // ping / pong are answered by axum
                }
            }
        }
    }

    tracing::info!(%peer, link = lease.id(), "controller session ended");
    drop(lease);
}

async fn handle_device_text(state: &AppState, text: &str) {
    match parse_frame(text) {
        Ok(InboundFrame::Telemetry(reading)) => {
            state.ingest(reading, NOTE_DEVICE).await;
        }
        Ok(InboundFrame::Identify) => {
            tracing::debug!("controller re-identified on an established link");
        }
        Err(e) => {
            tracing::warn!("dropping malformed device frame: {e}");
        }
    }
}

// ==============================================================================
// observers
// ==============================================================================

async fn observer_session(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    let mut subscription = state.broadcaster.subscribe();
    tracing::info!(%peer, subscriber = subscription.id(), "observer connected");

    // latest digest right away instead of waiting for the next tick
    match system_info_frame(&state.system_info().await) {
        Ok(frame) => {
            if socket.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
        Err(e) => tracing::error!("failed to encode system info: {e}"),
    }

    loop {
        tokio::select! {
            payload = subscription.recv() => {
                let Some(payload) = payload else { break };
                if socket.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if matches!(parse_frame(&text), Ok(InboundFrame::Identify)) {
                            // leave the observer set and become the controller, or be turned away
                            drop(subscription);
                            tracing::info!(%peer, "observer identified as controller");
                            match state.link.claim() {
                                Ok(lease) => run_linked(socket, state, lease, peer).await,
                                Err(e) => reject(socket, e, peer).await,
                            }
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%peer, "observer socket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!(%peer, subscriber = subscription.id(), "observer disconnected");
}

//! WebSocket front end of the relay.
//!
//! `GET /` answers a health line, `GET /ws` upgrades to a relay session.
//! Each socket gets a writer task draining its outbox; the reader loop
//! decodes client messages and hands them to [`Relay`].

use super::protocol::{ClientMessage, ServerMessage};
use super::Relay;
use crate::core::config::{RELAY_HEALTH_TEXT, RELAY_OUTBOX_CAPACITY};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws", get(ws_handler))
        .with_state(relay)
}

/// Bind `addr` and serve until `sos` fires. Returns the bound address
/// through `bound` before serving, so callers can use port 0.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<Relay>,
    sos: SignalOfStop,
    bound: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;
    let local = listener.local_addr()?;
    info!(event = "relay_listening", addr = %local, "Signaling relay listening");
    if let Some(tx) = bound {
        let _ = tx.send(local);
    }

    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move {
            sos.wait().await;
        })
        .await
        .context("relay server failed")
}

async fn health() -> &'static str {
    RELAY_HEALTH_TEXT
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(RELAY_OUTBOX_CAPACITY);
    let peer_id = relay.register(tx).await;

    // Ends once the relay drops the session (eviction) or the socket breaks.
    let writer_peer = peer_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(event = "relay_encode_failed", peer = %writer_peer, error = %e, "Dropping outbound message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = &mut writer => {
                debug!(event = "relay_writer_finished", peer = %peer_id, "Outbound side closed, ending session");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match frame {
            Ok(Message::Text(text)) => match ClientMessage::decode(text.as_str()) {
                Ok(msg) => {
                    if let Err(e) = relay.handle(&peer_id, msg).await {
                        warn!(event = "relay_message_dropped", peer = %peer_id, error = %e, "Dropping relay message");
                    }
                }
                Err(e) => {
                    warn!(event = "relay_malformed", peer = %peer_id, error = %e, "Ignoring malformed message");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(event = "relay_binary_ignored", peer = %peer_id, "Binary frames are not part of the relay protocol");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(event = "relay_socket_error", peer = %peer_id, error = %e, "Socket error");
                break;
            }
        }
    }

    relay.disconnect(&peer_id).await;
    writer.abort();
}

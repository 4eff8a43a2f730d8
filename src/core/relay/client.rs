//! Peer-side relay connection over `tokio-tungstenite`.
//!
//! A writer task drains outbound [`ClientMessage`]s into the socket and a
//! reader task decodes [`ServerMessage`]s into an mpsc queue. The queue
//! closing is how the rest of the node learns the relay is gone.

use super::protocol::{ClientMessage, PeerId, RoomId, ServerMessage, SignalPayload};
use crate::core::config::RELAY_HANDSHAKE_TIMEOUT;
use crate::core::error::SignalingError;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Cheap, cloneable sender for relay requests.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl RelayHandle {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.tx.send(msg).map_err(|_| SignalingError::Disconnected)
    }

    pub fn join(&self, room: &str) -> Result<(), SignalingError> {
        self.send(ClientMessage::Join {
            room_id: room.to_string(),
        })
    }

    pub fn leave(&self, room: &str) -> Result<(), SignalingError> {
        self.send(ClientMessage::Leave {
            room_id: room.to_string(),
        })
    }

    pub fn send_signal(
        &self,
        to: &PeerId,
        room: &RoomId,
        payload: &SignalPayload,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::SendSignal {
            to: to.clone(),
            room_id: room.clone(),
            signal: payload.encode(),
        })
    }
}

/// An established relay session.
pub struct RelayConnection {
    pub peer_id: PeerId,
    pub handle: RelayHandle,
    pub events: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Connect to `url`, wait for the relay's `welcome`, and spawn the I/O tasks.
pub async fn connect(url: &str, sos: SignalOfStop) -> Result<RelayConnection> {
    let url = Url::parse(url).with_context(|| format!("invalid relay url '{url}'"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("relay url must use ws:// or wss://, got {other}://"),
    }

    let (ws, _) = timeout(RELAY_HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
        .await
        .context("relay connect timed out")?
        .with_context(|| format!("failed to connect to relay {url}"))?;
    let (mut ws_write, mut ws_read) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_sos = sos.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = writer_sos.wait() => break,
                msg = out_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(event = "relay_encode_failed", error = %e, "Dropping outbound relay message");
                    continue;
                }
            };
            if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                warn!(event = "relay_write_failed", error = %e, "Relay socket write failed");
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let reader_sos = sos.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = reader_sos.wait() => break,
                frame = ws_read.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(event = "relay_malformed", error = %e, "Ignoring malformed relay message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(event = "relay_read_failed", error = %e, "Relay socket read failed");
                    break;
                }
            }
        }
        debug!(event = "relay_reader_done", "Relay reader finished");
    });

    let peer_id = match timeout(RELAY_HANDSHAKE_TIMEOUT, in_rx.recv()).await {
        Ok(Some(ServerMessage::Welcome { peer_id })) => peer_id,
        Ok(Some(other)) => return Err(anyhow!("expected welcome from relay, got {other:?}")),
        Ok(None) => bail!("relay closed before welcome"),
        Err(_) => bail!("relay did not send welcome in time"),
    };

    info!(event = "relay_connected", %url, %peer_id, "Connected to signaling relay");
    Ok(RelayConnection {
        peer_id,
        handle: RelayHandle::new(out_tx),
        events: in_rx,
    })
}

//! Signaling relay: room membership plus point-to-point forwarding of
//! opaque negotiation payloads.

pub mod client;
pub mod protocol;
mod rooms;
pub mod server;

pub use rooms::Relay;

#[cfg(test)]
mod tests {
    use super::client;
    use super::protocol::ServerMessage;
    use super::*;
    use crate::core::config::RELAY_HEALTH_TEXT;
    use crate::utils::sos::SignalOfStop;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_relay(sos: &SignalOfStop) -> std::net::SocketAddr {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let relay = Arc::new(Relay::new());
        let sos = sos.clone();
        tokio::spawn(async move {
            server::serve("127.0.0.1:0".parse().unwrap(), relay, sos, Some(tx))
                .await
                .unwrap();
        });
        rx.await.unwrap()
    }

    async fn next(conn: &mut client::RelayConnection) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), conn.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn websocket_clients_join_and_exchange_signals() {
        let sos = SignalOfStop::new();
        let addr = start_relay(&sos).await;
        let url = format!("ws://{addr}/ws");

        let mut b = client::connect(&url, sos.clone()).await.unwrap();
        b.handle.join("abc123").unwrap();
        assert!(matches!(next(&mut b).await, ServerMessage::PeerJoined { peer_ids, .. } if peer_ids.is_empty()));

        let mut a = client::connect(&url, sos.clone()).await.unwrap();
        a.handle.join("abc123").unwrap();
        match next(&mut a).await {
            ServerMessage::PeerJoined { peer_ids, .. } => assert_eq!(peer_ids, vec![b.peer_id.clone()]),
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut b).await {
            ServerMessage::PeerJoined { peer_ids, .. } => assert_eq!(peer_ids, vec![a.peer_id.clone()]),
            other => panic!("unexpected {other:?}"),
        }

        let payload = protocol::SignalPayload::Description(protocol::SessionDescription::offer("v=0"));
        b.handle
            .send_signal(&a.peer_id, &"abc123".to_string(), &payload)
            .unwrap();
        match next(&mut a).await {
            ServerMessage::Signal { from, signal, .. } => {
                assert_eq!(from, b.peer_id);
                assert_eq!(protocol::SignalPayload::decode(&signal).unwrap(), payload);
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(a);
        match next(&mut b).await {
            ServerMessage::PeerLeft { peer_id, .. } => assert!(!peer_id.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        sos.cancel();
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let sos = SignalOfStop::new();
        let addr = start_relay(&sos).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains(RELAY_HEALTH_TEXT));
        sos.cancel();
    }
}

//! Events surfaced to the application (UI / headless worker).

use crate::core::connection::state::SignalingState;
use crate::core::connection::ConnectionKey;
use crate::core::error::{NegotiationError, SignalingError, TransferError};
use crate::core::relay::protocol::{PeerId, RoomId};
use crate::core::transfer::offer::TransferOffer;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    RoomMembershipChanged {
        room: RoomId,
        joined: bool,
    },
    PeerListChanged {
        room: RoomId,
        peers: Vec<PeerId>,
    },
    /// The relay never confirmed a join; the room was given up.
    JoinFailed {
        room: RoomId,
        error: SignalingError,
    },
    ConnectionStateChanged {
        key: ConnectionKey,
        state: SignalingState,
    },
    ChannelOpened {
        key: ConnectionKey,
    },
    ConnectionClosed {
        key: ConnectionKey,
        reason: String,
    },
    NegotiationFailed {
        key: ConnectionKey,
        error: NegotiationError,
    },
    RelayLost,
    TransferQueued {
        key: ConnectionKey,
        id: Uuid,
        offer: TransferOffer,
    },
    /// An incoming offer waits for `accept` / `decline`.
    TransferOfferPending {
        key: ConnectionKey,
        id: Uuid,
        offer: TransferOffer,
    },
    DecisionExpired {
        key: ConnectionKey,
        id: Uuid,
    },
    TransferProgress {
        key: ConnectionKey,
        id: Uuid,
        direction: Direction,
        chunks: u64,
        total_chunks: u64,
        bytes: u64,
    },
    TransferCompleted {
        key: ConnectionKey,
        id: Uuid,
        direction: Direction,
        file_name: String,
        chunks: u64,
        bytes: u64,
        location: Option<String>,
    },
    TransferDeclined {
        key: ConnectionKey,
        id: Uuid,
        direction: Direction,
    },
    TransferFailed {
        key: ConnectionKey,
        id: Uuid,
        direction: Direction,
        error: TransferError,
    },
}

/// Forward an event to the application, if anyone is listening.
pub fn notify_app(tx: &Option<mpsc::UnboundedSender<AppEvent>>, event: AppEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

//! Error taxonomy shared by the relay, the connection manager and the
//! transfer engine.
//!
//! Each layer contains its own failures and surfaces them as events; none of
//! these errors is ever fatal to the process.

use thiserror::Error;

/// Malformed or unaddressable relay traffic. Dropped and logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("malformed relay message: {0}")]
    Malformed(String),

    #[error("peer {to} is not a member of room {room}")]
    Unaddressable { to: String, room: String },

    #[error("unknown relay session {0}")]
    UnknownSession(String),

    #[error("room id must not be empty")]
    EmptyRoom,

    #[error("relay transport closed")]
    Disconnected,

    #[error("relay did not confirm joining {room} within {secs}s")]
    JoinTimeout { room: String, secs: u64 },
}

/// Negotiation failed; the connection for the key is closed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("bad signal payload: {0}")]
    BadPayload(String),

    #[error("negotiation capability failed: {0}")]
    Capability(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("data channel closed")]
    ChannelClosed,

    #[error("negotiation cancelled")]
    Cancelled,
}

/// Failures of a single transfer session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// No accept/decline within the window. Treated as an implicit decline.
    #[error("no answer to offer within {secs}s")]
    Timeout { secs: u64 },

    /// Chunk count mismatch or sink failure; partial output is flagged incomplete.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Send attempted on a channel that is not open.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("source read failed: {0}")]
    Source(String),
}

impl TransferError {
    pub fn integrity_mismatch(received: u64, expected: u64) -> Self {
        Self::Integrity(format!("received {received} of {expected} chunks"))
    }
}

//! Seams to the negotiation capability (SDP, ICE, data channel).
//!
//! The connection manager only talks to these traits. [`super::rtc`]
//! implements them with webrtc-rs; tests use an in-memory switchboard.

use crate::core::relay::protocol::{IceCandidate, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// One message received on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Reliable, ordered message channel produced by a negotiated connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued locally but not yet handed to the transport.
    async fn buffered_amount(&self) -> usize;

    async fn close(&self) -> Result<()>;
}

/// Events raised by a negotiator and its channel, in the order they happen.
pub enum NegotiatorEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(ChannelMessage),
    ChannelClosed,
    Failed(String),
}

impl fmt::Debug for NegotiatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(&c.candidate).finish(),
            Self::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Offer/answer primitives for one remote peer.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds negotiators. Initiators get their data channel created up front so
/// it is part of the offer; responders receive it from the remote side.
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Result<Arc<dyn Negotiator>>;
}

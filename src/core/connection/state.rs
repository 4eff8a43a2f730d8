//! Pure negotiation state for one (room, peer) key.
//!
//! No I/O happens here: the peer task calls the capability, then records the
//! outcome through these transitions. Invalid transitions come back as
//! [`NegotiationError::InvalidTransition`], which closes the key.

use super::capability::{DataChannel, Role};
use crate::core::error::NegotiationError;
use crate::core::relay::protocol::IceCandidate;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Stable => "stable",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ConnectionState {
    role: Role,
    signaling: SignalingState,
    pending_candidates: VecDeque<IceCandidate>,
    channel: Option<Arc<dyn DataChannel>>,
}

impl ConnectionState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            signaling: SignalingState::New,
            pending_candidates: VecDeque::new(),
            channel: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn signaling(&self) -> SignalingState {
        self.signaling
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn expect(
        &self,
        action: &'static str,
        role: Role,
        from: SignalingState,
    ) -> Result<(), NegotiationError> {
        if self.role == role && self.signaling == from {
            Ok(())
        } else {
            Err(NegotiationError::InvalidTransition {
                action,
                state: self.signaling.as_str(),
            })
        }
    }

    /// Initiator applied its own offer.
    pub fn local_offer_set(&mut self) -> Result<(), NegotiationError> {
        self.expect("set local offer", Role::Initiator, SignalingState::New)?;
        self.signaling = SignalingState::HaveLocalOffer;
        Ok(())
    }

    /// Responder applied the remote offer.
    pub fn remote_offer_set(&mut self) -> Result<(), NegotiationError> {
        self.expect("apply remote offer", Role::Responder, SignalingState::New)?;
        self.signaling = SignalingState::HaveRemoteOffer;
        Ok(())
    }

    /// Responder applied its answer. Returns the buffered candidates in
    /// arrival order; the caller applies them now.
    pub fn local_answer_set(&mut self) -> Result<Vec<IceCandidate>, NegotiationError> {
        self.expect(
            "set local answer",
            Role::Responder,
            SignalingState::HaveRemoteOffer,
        )?;
        Ok(self.stabilize())
    }

    /// Initiator applied the remote answer. Same contract as
    /// [`Self::local_answer_set`].
    pub fn remote_answer_set(&mut self) -> Result<Vec<IceCandidate>, NegotiationError> {
        self.expect(
            "apply remote answer",
            Role::Initiator,
            SignalingState::HaveLocalOffer,
        )?;
        Ok(self.stabilize())
    }

    fn stabilize(&mut self) -> Vec<IceCandidate> {
        self.signaling = SignalingState::Stable;
        self.pending_candidates.drain(..).collect()
    }

    /// Returns the candidate if it can be applied right away; otherwise it
    /// is queued until stable (or dropped once closed).
    pub fn remote_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.signaling {
            SignalingState::Stable => Some(candidate),
            SignalingState::Closed => None,
            _ => {
                self.pending_candidates.push_back(candidate);
                None
            }
        }
    }

    /// The channel may only open after the descriptions are settled.
    pub fn channel_opened(
        &mut self,
        channel: Arc<dyn DataChannel>,
    ) -> Result<(), NegotiationError> {
        if self.signaling != SignalingState::Stable {
            return Err(NegotiationError::InvalidTransition {
                action: "open channel",
                state: self.signaling.as_str(),
            });
        }
        self.channel = Some(channel);
        Ok(())
    }

    /// Terminal. Hands back the channel so the caller can close it.
    pub fn close(&mut self) -> Option<Arc<dyn DataChannel>> {
        self.signaling = SignalingState::Closed;
        self.pending_candidates.clear();
        self.channel.take()
    }
}

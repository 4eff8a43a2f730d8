//! Relay wire messages and the signal payload they carry.
//!
//! Every message is a JSON object tagged by `type`. The relay only looks at
//! the envelope; the `signal` body is opaque to it and decoded by peers via
//! [`SignalPayload::decode`].

use crate::core::error::SignalingError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type PeerId = String;
pub type RoomId = String;

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    SendSignal {
        to: PeerId,
        room_id: RoomId,
        signal: Value,
    },
    #[serde(rename_all = "camelCase")]
    Leave { room_id: RoomId },
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        room_id: RoomId,
        peer_ids: Vec<PeerId>,
    },
    #[serde(rename_all = "camelCase")]
    Signal {
        from: PeerId,
        room_id: RoomId,
        signal: Value,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_id: RoomId, peer_id: PeerId },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

// ── Signal payload ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `{type: "offer" | "answer", sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Decoded body of a `signal` / `send-signal` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Serialize, Deserialize)]
struct CandidateEnvelope {
    candidate: IceCandidate,
}

impl SignalPayload {
    /// Single decoder for every signal shape. A `candidate` key wins over
    /// `type`, which must otherwise be `offer` or `answer`.
    pub fn decode(value: &Value) -> Result<Self, SignalingError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SignalingError::Malformed("signal is not an object".into()))?;

        if obj.contains_key("candidate") {
            let env: CandidateEnvelope = serde_json::from_value(value.clone())
                .map_err(|e| SignalingError::Malformed(format!("candidate: {e}")))?;
            return Ok(Self::Candidate(env.candidate));
        }

        match obj.get("type").and_then(Value::as_str) {
            Some("offer") | Some("answer") => serde_json::from_value(value.clone())
                .map(Self::Description)
                .map_err(|e| SignalingError::Malformed(format!("description: {e}"))),
            Some(other) => Err(SignalingError::Malformed(format!(
                "unknown signal type '{other}'"
            ))),
            None => Err(SignalingError::Malformed("signal has no type".into())),
        }
    }

    pub fn encode(&self) -> Value {
        let encoded = match self {
            Self::Description(desc) => serde_json::to_value(desc),
            Self::Candidate(candidate) => serde_json::to_value(CandidateEnvelope {
                candidate: candidate.clone(),
            }),
        };
        // Plain structs of strings and integers always serialize.
        encoded.unwrap_or(Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Description(d) if d.kind == SdpKind::Offer => "offer",
            Self::Description(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

//! Channel wire protocol: JSON control messages in text frames, raw file
//! chunks in binary frames.

use crate::core::config::CHUNK_SIZE;
use crate::core::connection::capability::ChannelMessage;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_chunk_size() -> u64 {
    CHUNK_SIZE as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    FileOffer {
        file_name: String,
        file_size: u64,
        #[serde(default, alias = "fileType")]
        mime_type: String,
        total_chunks: u64,
        #[serde(default = "default_chunk_size")]
        chunk_size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<Uuid>,
    },
    /// Answers echo the offer's `transferId` when it carried one.
    #[serde(rename_all = "camelCase")]
    FileAccept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    FileDecline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    Done { file_name: String },
}

impl ControlMessage {
    pub fn encode(&self) -> String {
        // Only strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn transfer_id(&self) -> Option<Uuid> {
        match self {
            ControlMessage::FileOffer { transfer_id, .. }
            | ControlMessage::FileAccept { transfer_id }
            | ControlMessage::FileDecline { transfer_id } => *transfer_id,
            ControlMessage::Done { .. } => None,
        }
    }
}

/// Everything that can arrive on a transfer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(Bytes),
}

impl Frame {
    pub fn decode(msg: ChannelMessage) -> Result<Self> {
        match msg {
            ChannelMessage::Text(text) => serde_json::from_str(&text)
                .map(Frame::Control)
                .with_context(|| format!("invalid control message: {text}")),
            ChannelMessage::Binary(data) => Ok(Frame::Chunk(data)),
        }
    }
}

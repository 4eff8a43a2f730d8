use super::protocol::ControlMessage;
use crate::core::config::MAX_CHUNK_SIZE;
use crate::core::error::TransferError;
use uuid::Uuid;

/// Metadata announced before a file is sent.
///
/// `total_chunks == ceil(file_size / chunk_size)` holds for every offer this
/// crate builds and is checked for every offer it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
}

impl TransferOffer {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        mime_type: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE) as u64;
        Self {
            file_name: file_name.into(),
            file_size,
            mime_type: mime_type.into(),
            total_chunks: file_size.div_ceil(chunk_size),
            chunk_size,
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.file_name.trim().is_empty() {
            return Err(TransferError::InvalidOffer("empty file name".into()));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidOffer("chunk size is zero".into()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE as u64 {
            return Err(TransferError::InvalidOffer(format!(
                "chunk size {} exceeds {MAX_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        let expected = self.file_size.div_ceil(self.chunk_size);
        if self.total_chunks != expected {
            return Err(TransferError::InvalidOffer(format!(
                "totalChunks {} but {} bytes in {} byte chunks needs {}",
                self.total_chunks, self.file_size, self.chunk_size, expected
            )));
        }
        Ok(())
    }

    /// Exact length of chunk `index`; the last one holds the remainder.
    pub fn chunk_len(&self, index: u64) -> usize {
        let start = index.saturating_mul(self.chunk_size);
        self.file_size.saturating_sub(start).min(self.chunk_size) as usize
    }

    pub fn to_message(&self, transfer_id: Uuid) -> ControlMessage {
        ControlMessage::FileOffer {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            mime_type: self.mime_type.clone(),
            total_chunks: self.total_chunks,
            chunk_size: self.chunk_size,
            transfer_id: Some(transfer_id),
        }
    }

    pub fn from_message(msg: &ControlMessage) -> Option<Self> {
        match msg {
            ControlMessage::FileOffer {
                file_name,
                file_size,
                mime_type,
                total_chunks,
                chunk_size,
                ..
            } => Some(Self {
                file_name: file_name.clone(),
                file_size: *file_size,
                mime_type: mime_type.clone(),
                total_chunks: *total_chunks,
                chunk_size: *chunk_size,
            }),
            _ => None,
        }
    }
}

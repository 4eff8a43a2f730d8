//! Where outgoing bytes come from.

use super::offer::TransferOffer;
use crate::core::error::TransferError;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes {
        name: String,
        mime_type: String,
        data: Bytes,
    },
}

impl FileSource {
    /// Build the offer for this source.
    pub async fn describe(&self, chunk_size: usize) -> Result<TransferOffer, TransferError> {
        match self {
            FileSource::Path(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| TransferError::Source(format!("{}: {e}", path.display())))?;
                if !meta.is_file() {
                    return Err(TransferError::Source(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| TransferError::Source(format!("{} has no file name", path.display())))?;
                Ok(TransferOffer::new(
                    name,
                    meta.len(),
                    mime_guess::from_path(path).first_or_octet_stream().essence_str(),
                    chunk_size,
                ))
            }
            FileSource::Bytes {
                name,
                mime_type,
                data,
            } => Ok(TransferOffer::new(
                name.clone(),
                data.len() as u64,
                mime_type.clone(),
                chunk_size,
            )),
        }
    }

    pub async fn open(&self) -> Result<ChunkReader, TransferError> {
        match self {
            FileSource::Path(path) => {
                let file = File::open(path)
                    .await
                    .map_err(|e| TransferError::Source(format!("{}: {e}", path.display())))?;
                Ok(ChunkReader::File(file))
            }
            FileSource::Bytes { data, .. } => Ok(ChunkReader::Memory {
                data: data.clone(),
                pos: 0,
            }),
        }
    }
}

/// Sequential reader handing out chunks of an exact length.
pub enum ChunkReader {
    File(File),
    Memory { data: Bytes, pos: usize },
}

impl ChunkReader {
    pub async fn read_chunk(&mut self, len: usize) -> Result<Bytes, TransferError> {
        match self {
            ChunkReader::File(file) => {
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| TransferError::Source(format!("read failed: {e}")))?;
                Ok(Bytes::from(buf))
            }
            ChunkReader::Memory { data, pos } => {
                let end = *pos + len;
                if end > data.len() {
                    return Err(TransferError::Source("source shorter than announced".into()));
                }
                let chunk = data.slice(*pos..end);
                *pos = end;
                Ok(chunk)
            }
        }
    }
}

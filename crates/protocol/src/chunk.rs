//! Binary chunk frames for file uploads.
//!
//! Wire layout: `[10 bytes file id][u32 LE chunk number][u32 LE data size]
//! [data][sidecar JSON]`. The sidecar on chunk 0 describes the whole
//! upload; later chunks carry only the correlation id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{is_valid_id, ID_LENGTH};
use crate::validate::ValidationError;

/// Bytes before the file data begins.
pub const CHUNK_HEADER_LEN: usize = ID_LENGTH + 4 + 4;

/// Trailing JSON metadata on every chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSidecar {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<u32>,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

impl ChunkSidecar {
    /// Sidecar for chunk 0: carries the upload's type, payload, and total
    /// chunk count alongside the correlation id.
    pub fn opening(
        msg_type: impl Into<String>,
        payload: Value,
        chunks: u32,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: Some(msg_type.into()),
            payload: Some(payload),
            chunks: Some(chunks),
            message_id: message_id.into(),
        }
    }

    /// Sidecar for every chunk after the first.
    pub fn continuation(message_id: impl Into<String>) -> Self {
        Self {
            msg_type: None,
            payload: None,
            chunks: None,
            message_id: message_id.into(),
        }
    }
}

/// A parsed binary chunk frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    pub file_id: String,
    pub chunk_number: u32,
    pub data: Vec<u8>,
    pub sidecar: ChunkSidecar,
}

impl ChunkFrame {
    /// Parses a raw binary WebSocket frame.
    pub fn parse(frame: &[u8]) -> Result<Self, ValidationError> {
        if frame.len() < CHUNK_HEADER_LEN {
            return Err(ValidationError::Unsupported);
        }

        let file_id = std::str::from_utf8(&frame[..ID_LENGTH])
            .map_err(|_| ValidationError::InvalidFileId)?;
        if !is_valid_id(file_id) {
            return Err(ValidationError::InvalidFileId);
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&frame[ID_LENGTH..ID_LENGTH + 4]);
        let chunk_number = u32::from_le_bytes(word);
        word.copy_from_slice(&frame[ID_LENGTH + 4..CHUNK_HEADER_LEN]);
        let data_size = u32::from_le_bytes(word) as usize;

        if frame.len() < CHUNK_HEADER_LEN + data_size {
            return Err(ValidationError::Unsupported);
        }
        let data = frame[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + data_size].to_vec();

        let sidecar: ChunkSidecar =
            serde_json::from_slice(&frame[CHUNK_HEADER_LEN + data_size..])
                .map_err(|_| ValidationError::Unsupported)?;

        Ok(Self {
            file_id: file_id.to_owned(),
            chunk_number,
            data,
            sidecar,
        })
    }
}

/// Encodes a chunk frame for the wire.
pub fn pack_chunk(
    file_id: &str,
    chunk_number: u32,
    data: &[u8],
    sidecar: &ChunkSidecar,
) -> Result<Vec<u8>, serde_json::Error> {
    debug_assert!(is_valid_id(file_id));

    let sidecar_json = serde_json::to_vec(sidecar)?;
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + data.len() + sidecar_json.len());
    buf.extend_from_slice(file_id.as_bytes());
    buf.extend_from_slice(&chunk_number.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(&sidecar_json);
    Ok(buf)
}

//! Inbound frame validation.
//!
//! Failures come in two kinds. Critical failures mean the frame could not
//! be understood at all (not JSON, or a binary frame shorter than its
//! fixed header); the connection that produced one cannot be trusted and
//! is closed. Format failures mean a well-formed JSON object had missing
//! or mistyped fields; they earn a single `error` response and the
//! connection survives.
//!
//! The failure strings are part of the wire contract: clients match on
//! them verbatim.

use serde_json::Value;

use crate::chunk::ChunkFrame;
use crate::envelope::Message;
use crate::id::is_valid_id;

/// A rejected inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported data")]
    Unsupported,
    #[error("'messageId' field missed")]
    MessageIdMissed,
    #[error("'type' field missed")]
    TypeMissed,
    #[error("'payload' field missed")]
    PayloadMissed,
    #[error("'messageId' should be a string")]
    MessageIdNotString,
    #[error("'type' should be a string")]
    TypeNotString,
    #[error("'payload' should be an object")]
    PayloadNotObject,
    #[error("Invalid message id")]
    InvalidMessageId,
    #[error("Invalid file id")]
    InvalidFileId,
}

impl ValidationError {
    /// Critical failures close the connection; the rest are reported back
    /// to the sender.
    pub fn is_critical(&self) -> bool {
        matches!(self, ValidationError::Unsupported)
    }
}

/// Validates an inbound text frame as a fully-formed request envelope.
pub fn validate_text(raw: &str) -> Result<Message, ValidationError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ValidationError::Unsupported)?;
    let obj = value.as_object().ok_or(ValidationError::Unsupported)?;

    let message_id = match obj.get("messageId") {
        None => return Err(ValidationError::MessageIdMissed),
        Some(Value::String(s)) => s,
        Some(_) => return Err(ValidationError::MessageIdNotString),
    };
    if !is_valid_id(message_id) {
        return Err(ValidationError::InvalidMessageId);
    }

    let msg_type = match obj.get("type") {
        None => return Err(ValidationError::TypeMissed),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ValidationError::TypeNotString),
    };

    let payload = match obj.get("payload") {
        None => return Err(ValidationError::PayloadMissed),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err(ValidationError::PayloadNotObject),
    };

    Ok(Message {
        message_id: message_id.clone(),
        msg_type: Some(msg_type),
        payload,
    })
}

/// Validates an inbound binary frame as a chunk frame.
pub fn validate_binary(frame: &[u8]) -> Result<ChunkFrame, ValidationError> {
    ChunkFrame::parse(frame)
}

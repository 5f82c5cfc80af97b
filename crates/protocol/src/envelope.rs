//! The JSON envelope wrapping every text-frame message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::generate_id;
use crate::TYPE_ERROR;

/// Envelope for all text-frame communication.
///
/// Requests and server pushes carry a `type`; responses echo the request's
/// `messageId` and omit `type` entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    pub payload: Value,
}

impl Message {
    /// Creates a request or update message with a fresh id.
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: generate_id(),
            msg_type: Some(msg_type.into()),
            payload,
        }
    }

    /// Creates a response to the message identified by `message_id`.
    pub fn response(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            msg_type: None,
            payload,
        }
    }

    /// Creates an `error` message carrying `text`.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(TYPE_ERROR, serde_json::json!({ "error": text.into() }))
    }

    /// `true` when this envelope is a response (carries no `type`).
    pub fn is_response(&self) -> bool {
        self.msg_type.is_none()
    }
}

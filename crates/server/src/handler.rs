//! Application handler trait.
//!
//! Implementors provide domain logic while the engine handles connection
//! management, validation, and routing. Hooks are awaited one at a time
//! per connection: the next inbound frame is not dispatched until the
//! in-progress call returns.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use ctproto_protocol::Message;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type surfaced by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A fully reassembled upload handed to the application.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_id: String,
    /// `type` from the upload's opening chunk, if it ever arrived.
    pub msg_type: Option<String>,
    /// `payload` from the upload's opening chunk.
    pub payload: Option<Value>,
    pub file: Vec<u8>,
}

/// Application hooks driven by the protocol engine.
pub trait Handler: Send + Sync + 'static {
    /// Called with the payload of the `authorize` message. The returned
    /// value becomes the client's auth data and is echoed back as the
    /// authorize response payload. Returning an error closes the
    /// connection.
    fn on_auth(&self, payload: Value) -> HandlerFuture<'_, Result<Value, HandlerError>>;

    /// Called for every well-formed message on an authorized connection.
    /// A returned payload is sent back as the response to the message's
    /// id; `None` sends nothing.
    fn on_message(
        &self,
        message: Message,
    ) -> HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        let _ = message;
        Box::pin(async { Ok(None) })
    }

    /// Called once an upload is fully reassembled. The returned payload
    /// is sent back keyed by the upload's file id.
    fn on_upload_message(
        &self,
        request: UploadRequest,
    ) -> HandlerFuture<'_, Result<Option<Value>, HandlerError>> {
        let _ = request;
        Box::pin(async { Ok(None) })
    }
}

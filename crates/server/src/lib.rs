//! CTProto server engine.
//!
//! Listens for WebSocket connections, gates each one behind an
//! `authorize` handshake, and dispatches JSON and binary frames to an
//! application [`Handler`]. The crate owns framing, validation, timeouts,
//! response routing, and chunked upload reassembly; hosts supply domain
//! logic through the handler trait.

mod connection;
mod handler;
mod registry;
mod server;
mod uploads;

pub use connection::{SendError, Sender};
pub use handler::{Handler, HandlerError, HandlerFuture, UploadRequest};
pub use registry::{ClientQuery, ClientRecord, ClientRegistry};
pub use server::{Server, ServerConfig};

/// Outbound send buffer per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

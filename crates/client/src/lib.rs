//! CTProto client engine.
//!
//! Gives hosts a typed request/response channel over a persistent
//! WebSocket: `send` resolves with the server's response payload,
//! `send_file` drives a chunked upload with per-chunk acknowledgement.
//! Messages issued while the link is down are queued and flushed after
//! reconnection; reconnection itself is bounded, after which the client
//! closes for good and rejects everything still outstanding.

mod client;
mod handler;
mod reconnect;
mod upload;

pub use client::{Client, ClientConfig};
pub use handler::{ClientHandler, HandlerFuture};

/// Outbound send buffer.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors surfaced to client callers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("upload {file_id}: no acknowledgement for chunk {chunk}")]
    ChunkAckTimeout { file_id: String, chunk: u32 },

    #[error("upload {file_id}: malformed acknowledgement for chunk {chunk}")]
    BadChunkAck { file_id: String, chunk: u32 },
}

//! Wire-level types for the CTProto messaging protocol.
//!
//! CTProto runs two framing modes over one persistent WebSocket: UTF-8
//! JSON envelopes (text frames) and length-prefixed file chunks (binary
//! frames). This crate is the pure data layer shared by the server and
//! client engines: envelope construction, id generation, the chunk codec,
//! and inbound validation. No I/O happens here.

pub mod chunk;
pub mod envelope;
pub mod id;
pub mod validate;

use std::time::Duration;

/// Reserved message type that initiates authorization.
pub const TYPE_AUTHORIZE: &str = "authorize";

/// Reserved message type for server-emitted errors.
pub const TYPE_ERROR: &str = "error";

/// Bytes of file data per upload chunk.
pub const CHUNK_SIZE: usize = 10_000;

/// Time a fresh connection has to send its `authorize` message.
pub const AUTH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Idle time after which the server drops a partial upload.
pub const UPLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Time the upload driver waits for a chunk acknowledgement before
/// re-sending the chunk.
pub const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-sends per chunk before an upload job is failed.
pub const MAX_CHUNK_RETRIES: u32 = 5;

/// Delay before each reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnect attempts per outage before the client closes for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Maximum WebSocket message size accepted by either peer (50 MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

// Re-export the primary types for convenience.
pub use chunk::{pack_chunk, ChunkFrame, ChunkSidecar, CHUNK_HEADER_LEN};
pub use envelope::Message;
pub use id::{generate_id, is_valid_id, ID_LENGTH};
pub use validate::{validate_binary, validate_text, ValidationError};

//! Chunked upload driver.
//!
//! Uploads are stop-and-wait per file: the next chunk is not emitted
//! until the previous one is acknowledged. Each emission arms a timer;
//! on expiry the same chunk (same bytes, same correlation id) goes out
//! again, up to the retry budget. Distinct files interleave freely.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use ctproto_protocol::{
    generate_id, pack_chunk, ChunkSidecar, CHUNK_ACK_TIMEOUT, CHUNK_SIZE, MAX_CHUNK_RETRIES,
};

use crate::client::ClientInner;
use crate::handler::ClientHandler;
use crate::ClientError;

/// A chunk frame waiting for the link to come back.
#[derive(Debug, Clone)]
pub(crate) struct QueuedChunk {
    pub(crate) file_id: String,
    pub(crate) frame: Vec<u8>,
}

/// Uploads `file` under a fresh file id and resolves with the payload
/// the server application returned for the completed upload.
pub(crate) async fn send_file<H: ClientHandler>(
    inner: &Arc<ClientInner<H>>,
    msg_type: &str,
    file: Vec<u8>,
    payload: Value,
) -> Result<Value, ClientError> {
    if inner.terminated.load(Ordering::SeqCst) {
        return Err(ClientError::Closed);
    }

    let file_id = generate_id();
    let total = chunk_count(file.len());
    inner.jobs.lock().await.insert(file_id.clone());

    // The completion response arrives keyed by the file id itself.
    let (done_tx, done_rx) = oneshot::channel();
    inner.pending.lock().await.insert(file_id.clone(), done_tx);

    if let Err(e) = drive_chunks(inner, &file_id, msg_type, &file, total, &payload).await {
        inner.fail_upload(&file_id).await;
        return Err(e);
    }

    let outcome = done_rx.await.map_err(|_| ClientError::Closed);
    inner.jobs.lock().await.remove(&file_id);
    outcome
}

fn chunk_count(len: usize) -> u32 {
    // An empty file still travels as one zero-length chunk.
    len.div_ceil(CHUNK_SIZE).max(1) as u32
}

/// Emits every chunk in order, waiting out each acknowledgement.
async fn drive_chunks<H: ClientHandler>(
    inner: &Arc<ClientInner<H>>,
    file_id: &str,
    msg_type: &str,
    file: &[u8],
    total: u32,
    payload: &Value,
) -> Result<(), ClientError> {
    for chunk_number in 0..total {
        let start = chunk_number as usize * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(file.len());
        let data = &file[start..end];

        let message_id = generate_id();
        let sidecar = if chunk_number == 0 {
            ChunkSidecar::opening(msg_type, payload.clone(), total, &message_id)
        } else {
            ChunkSidecar::continuation(&message_id)
        };
        let frame = pack_chunk(file_id, chunk_number, data, &sidecar)?;

        let ack = await_ack(inner, file_id, chunk_number, &message_id, frame).await?;

        let ack_matches = ack.get("fileId").and_then(Value::as_str) == Some(file_id)
            && ack.get("chunkNumber").and_then(Value::as_u64) == Some(u64::from(chunk_number));
        if !ack_matches {
            return Err(ClientError::BadChunkAck {
                file_id: file_id.to_owned(),
                chunk: chunk_number,
            });
        }
    }
    Ok(())
}

/// Emits one chunk and waits for its acknowledgement, re-sending the
/// identical frame on every timeout until the retry budget runs out.
async fn await_ack<H: ClientHandler>(
    inner: &Arc<ClientInner<H>>,
    file_id: &str,
    chunk_number: u32,
    message_id: &str,
    frame: Vec<u8>,
) -> Result<Value, ClientError> {
    let (tx, mut rx) = oneshot::channel();
    inner
        .pending
        .lock()
        .await
        .insert(message_id.to_owned(), tx);

    let mut retries = 0u32;
    loop {
        inner
            .emit_or_queue_chunk(QueuedChunk {
                file_id: file_id.to_owned(),
                frame: frame.clone(),
            })
            .await;

        match tokio::time::timeout(CHUNK_ACK_TIMEOUT, &mut rx).await {
            Ok(Ok(payload)) => return Ok(payload),
            // The pending table was torn down underneath us.
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                retries += 1;
                if retries > MAX_CHUNK_RETRIES {
                    inner.pending.lock().await.remove(message_id);
                    return Err(ClientError::ChunkAckTimeout {
                        file_id: file_id.to_owned(),
                        chunk: chunk_number,
                    });
                }
                tracing::debug!(chunk = chunk_number, retries, "chunk ack timed out, re-sending");
            }
        }
    }
}

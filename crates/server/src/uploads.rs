//! Chunked upload reassembly.
//!
//! Each in-progress upload owns a slot: a growable buffer, the set of
//! received chunk indices, and the metadata carried by the opening chunk.
//! A slot exists from the first chunk (in any order) until the file
//! completes or sits idle too long. Idle reaping is done by a timer task
//! that holds only the file id and re-looks the slot up when it fires, so
//! a slot that completed in the meantime is left alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use ctproto_protocol::{ChunkFrame, Message, CHUNK_SIZE, UPLOAD_IDLE_TIMEOUT};

use crate::handler::UploadRequest;

type SlotMap = HashMap<String, UploadSlot>;

#[derive(Default)]
struct UploadSlot {
    msg_type: Option<String>,
    payload: Option<Value>,
    total_chunks: Option<u32>,
    buffer: Vec<u8>,
    received: HashSet<u32>,
    idle_timer: Option<JoinHandle<()>>,
}

impl UploadSlot {
    fn is_complete(&self) -> bool {
        match self.total_chunks {
            Some(total) => (0..total).all(|i| self.received.contains(&i)),
            None => false,
        }
    }
}

impl Drop for UploadSlot {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

/// Reassembly state for one connection's uploads.
pub(crate) struct UploadStore {
    slots: Arc<Mutex<SlotMap>>,
}

impl UploadStore {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Inserts one validated chunk.
    ///
    /// Returns the per-chunk acknowledgement to send back and, when this
    /// chunk was the last missing piece, the assembled upload.
    pub(crate) async fn insert_chunk(
        &self,
        frame: ChunkFrame,
    ) -> (Message, Option<UploadRequest>) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(frame.file_id.clone()).or_default();

        // Upload metadata travels on chunk 0 only. Known values are never
        // downgraded by a re-delivered opening chunk.
        if frame.chunk_number == 0 {
            if slot.msg_type.is_none() {
                slot.msg_type = frame.sidecar.msg_type.clone();
            }
            if slot.payload.is_none() {
                slot.payload = frame.sidecar.payload.clone();
            }
            if slot.total_chunks.is_none() {
                slot.total_chunks = frame.sidecar.chunks;
            }
        }

        let offset = frame.chunk_number as usize * CHUNK_SIZE;
        let end = offset + frame.data.len();
        if slot.buffer.len() < end {
            slot.buffer.resize(end, 0);
        }
        slot.buffer[offset..end].copy_from_slice(&frame.data);
        slot.received.insert(frame.chunk_number);

        // Every chunk buys the upload another idle window.
        if let Some(timer) = slot.idle_timer.take() {
            timer.abort();
        }
        slot.idle_timer = Some(tokio::spawn(idle_reaper(
            Arc::clone(&self.slots),
            frame.file_id.clone(),
        )));

        let ack = Message::response(
            &frame.sidecar.message_id,
            serde_json::json!({
                "chunkNumber": frame.chunk_number,
                "type": slot.msg_type.clone(),
                "fileId": frame.file_id.clone(),
            }),
        );

        let completed = if slot.is_complete() {
            slots.remove(&frame.file_id).map(|mut slot| UploadRequest {
                file_id: frame.file_id,
                msg_type: slot.msg_type.take(),
                payload: slot.payload.take(),
                file: std::mem::take(&mut slot.buffer),
            })
        } else {
            None
        };

        (ack, completed)
    }

    /// Drops every slot (connection is going away).
    pub(crate) async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

async fn idle_reaper(slots: Arc<Mutex<SlotMap>>, file_id: String) {
    tokio::time::sleep(UPLOAD_IDLE_TIMEOUT).await;
    if slots.lock().await.remove(&file_id).is_some() {
        tracing::debug!(file_id = %file_id, "upload idle timeout, dropping partial file");
    }
}

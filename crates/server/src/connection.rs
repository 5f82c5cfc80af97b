//! Per-connection protocol engine: read/write pumps and the
//! authorization state machine.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use ctproto_protocol::{
    validate_binary, validate_text, Message, AUTH_TIMEOUT, TYPE_AUTHORIZE,
};

use crate::handler::Handler;
use crate::registry::{ClientRecord, ClientRegistry};
use crate::uploads::UploadStore;
use crate::SEND_BUFFER_SIZE;

/// Handle for sending frames to one connection.
///
/// Cloneable and cheap. Sends go through the connection's write pump, so
/// they never block the caller.
#[derive(Debug, Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

/// Error returned when the send buffer is full or the connection is gone.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

impl Sender {
    /// Sends a protocol [`Message`] as a JSON text frame.
    pub fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an orderly close frame with the given code and reason.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), SendError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        self.tx
            .try_send(WsMessage::Close(Some(frame)))
            .map_err(|_| SendError)
    }

    /// `true` while the write pump is alive.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
impl Sender {
    pub(crate) fn for_tests(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }
}

/// Runs one connection to completion: spawns the write pump, drives the
/// state machine on the read side, and cleans up registry and upload
/// state afterwards.
pub(crate) async fn run_connection<S, H>(
    ws_stream: S,
    conn_id: String,
    handler: Arc<H>,
    registry: ClientRegistry,
    disable_logs: bool,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let sender = Sender { tx };
    let uploads = UploadStore::new();

    let (ws_sink, ws_read) = ws_stream.split();
    let write = tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    read_pump(
        ws_read,
        sender,
        &conn_id,
        handler,
        &registry,
        &uploads,
        disable_logs,
        &cancel,
    )
    .await;

    // Connection is over: drop any partial uploads and forget the client.
    uploads.clear().await;
    let id = conn_id.clone();
    registry.find(move |c| c.id == id).remove().await;

    // All senders are gone now, so the write pump drains and exits.
    let _ = write.await;
    if !disable_logs {
        tracing::info!(conn = %conn_id, "connection closed");
    }
}

/// Write pump: drains the send channel into the WebSocket sink.
///
/// A queued close frame is forwarded and ends the pump; otherwise the
/// pump sends its own close frame once the channel is exhausted.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        let is_close = matches!(ws_msg, WsMessage::Close(_));
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            return;
                        }
                        if is_close {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = sink.close().await;
}

enum Disposition {
    Continue,
    Close(CloseCode, String),
}

/// Read pump: drives the authorization state machine and dispatches
/// frames.
#[allow(clippy::too_many_arguments)]
async fn read_pump<S, H>(
    mut stream: S,
    sender: Sender,
    conn_id: &str,
    handler: Arc<H>,
    registry: &ClientRegistry,
    uploads: &UploadStore,
    disable_logs: bool,
    cancel: &CancellationToken,
) where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Send + Unpin,
    H: Handler,
{
    let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
    tokio::pin!(auth_deadline);
    let mut auth_timer_armed = true;
    let mut authorized = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sender.close(CloseCode::Normal, "");
                break;
            }

            () = &mut auth_deadline, if auth_timer_armed && !authorized => {
                if !disable_logs {
                    tracing::info!(conn = %conn_id, "no authorize message in time");
                }
                let _ = sender.close(CloseCode::Again, "Authorization required");
                break;
            }

            frame = stream.next() => {
                let disposition = match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        auth_timer_armed = false;
                        handle_text(
                            &text,
                            &sender,
                            conn_id,
                            &handler,
                            registry,
                            &mut authorized,
                            disable_logs,
                        )
                        .await
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        auth_timer_armed = false;
                        if !authorized {
                            Disposition::Close(CloseCode::Unsupported, "Unsupported data".into())
                        } else {
                            handle_binary(&data, &sender, &handler, uploads).await
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        // Transport keepalive; not a protocol message.
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                        Disposition::Continue
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {
                        Disposition::Continue
                    }
                    Some(Ok(WsMessage::Close(_))) => break,
                    Some(Err(e)) => {
                        tracing::error!(conn = %conn_id, "read pump error: {e}");
                        break;
                    }
                    None => break,
                };

                match disposition {
                    Disposition::Continue => {}
                    Disposition::Close(code, reason) => {
                        let _ = sender.close(code, &reason);
                        break;
                    }
                }
            }
        }
    }
}

/// Handles one inbound text frame in either state.
async fn handle_text<H: Handler>(
    text: &str,
    sender: &Sender,
    conn_id: &str,
    handler: &Arc<H>,
    registry: &ClientRegistry,
    authorized: &mut bool,
    disable_logs: bool,
) -> Disposition {
    let msg = match validate_text(text) {
        Ok(msg) => msg,
        Err(e) if e.is_critical() => {
            return Disposition::Close(CloseCode::Unsupported, e.to_string());
        }
        Err(e) => {
            let _ = sender.send_msg(&Message::error(format!("Message Format Error: {e}")));
            return Disposition::Continue;
        }
    };

    if !*authorized {
        return authorize(msg, sender, conn_id, handler, registry, authorized, disable_logs).await;
    }

    if msg.msg_type.as_deref() == Some(TYPE_AUTHORIZE) {
        // Duplicate authorize after a successful one is ignored.
        return Disposition::Continue;
    }

    let message_id = msg.message_id.clone();
    match handler.on_message(msg).await {
        Ok(Some(payload)) => {
            let _ = sender.send_msg(&Message::response(message_id, payload));
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(conn = %conn_id, error = %e, "message handler failed");
        }
    }
    Disposition::Continue
}

/// Handles the first well-formed message of a connection.
async fn authorize<H: Handler>(
    msg: Message,
    sender: &Sender,
    conn_id: &str,
    handler: &Arc<H>,
    registry: &ClientRegistry,
    authorized: &mut bool,
    disable_logs: bool,
) -> Disposition {
    if msg.msg_type.as_deref() != Some(TYPE_AUTHORIZE) {
        return Disposition::Close(CloseCode::Policy, "Unauthorized".into());
    }

    match handler.on_auth(msg.payload).await {
        Ok(auth_data) => {
            registry
                .add(ClientRecord {
                    id: conn_id.to_owned(),
                    auth_data: auth_data.clone(),
                    sender: sender.clone(),
                })
                .await;
            let _ = sender.send_msg(&Message::response(msg.message_id, auth_data));
            *authorized = true;
            if !disable_logs {
                tracing::info!(conn = %conn_id, "client authorized");
            }
            Disposition::Continue
        }
        Err(e) => Disposition::Close(CloseCode::Policy, format!("Authorization failed: {e}")),
    }
}

/// Handles one inbound binary frame on an authorized connection.
async fn handle_binary<H: Handler>(
    data: &[u8],
    sender: &Sender,
    handler: &Arc<H>,
    uploads: &UploadStore,
) -> Disposition {
    let frame = match validate_binary(data) {
        Ok(frame) => frame,
        Err(e) if e.is_critical() => {
            return Disposition::Close(CloseCode::Unsupported, e.to_string());
        }
        Err(e) => {
            let _ = sender.send_msg(&Message::error(format!("Message Format Error: {e}")));
            return Disposition::Continue;
        }
    };

    let (ack, completed) = uploads.insert_chunk(frame).await;
    let _ = sender.send_msg(&ack);

    if let Some(request) = completed {
        let file_id = request.file_id.clone();
        match handler.on_upload_message(request).await {
            Ok(payload) => {
                let payload = payload.unwrap_or_else(|| serde_json::json!({}));
                let _ = sender.send_msg(&Message::response(file_id, payload));
            }
            Err(e) => {
                tracing::error!(file_id = %file_id, error = %e, "upload handler failed");
            }
        }
    }
    Disposition::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_display() {
        assert!(SendError.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn sender_reports_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender { tx };
        assert!(sender.is_connected());
        drop(rx);
        assert!(!sender.is_connected());
        assert!(sender
            .send_msg(&Message::new("ping", serde_json::json!({})))
            .is_err());
    }

    #[tokio::test]
    async fn sender_queues_close_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = Sender { tx };
        sender.close(CloseCode::Policy, "Unauthorized").unwrap();

        match rx.recv().await {
            Some(WsMessage::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason.as_ref(), "Unauthorized");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

//! Connection management and the send/await-reply engine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use ctproto_protocol::{Message, MAX_MESSAGE_SIZE, TYPE_AUTHORIZE};

use crate::handler::ClientHandler;
use crate::upload::QueuedChunk;
use crate::{ClientError, SEND_BUFFER_SIZE};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server, e.g. `ws://localhost:8080/`.
    pub api_url: String,
    /// Payload of the `authorize` message sent on every connection open.
    pub auth_request_payload: Value,
    /// Suppresses the engine's informational logs.
    pub disable_logs: bool,
}

/// State of the underlying link.
pub(crate) enum Link {
    Open(mpsc::Sender<WsMessage>),
    Connecting,
    Closed,
}

/// A CTProto client.
///
/// Cheap to clone; all clones share one connection.
pub struct Client<H: ClientHandler> {
    inner: Arc<ClientInner<H>>,
}

impl<H: ClientHandler> Clone for Client<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ClientHandler> Client<H> {
    /// Connects to the server and primes authorization.
    ///
    /// The authorize response is dispatched to the handler's `on_auth`
    /// once it arrives. A failed initial connection is returned to the
    /// caller; the reconnect loop only guards links that were up once.
    pub async fn connect(config: ClientConfig, handler: H) -> Result<Self, ClientError> {
        let inner = Arc::new(ClientInner {
            config,
            handler: Arc::new(handler),
            link: Mutex::new(Link::Closed),
            pending: Mutex::new(HashMap::new()),
            text_queue: Mutex::new(VecDeque::new()),
            chunk_queue: Mutex::new(VecDeque::new()),
            auth_request_id: Mutex::new(None),
            jobs: Mutex::new(HashSet::new()),
            reconnecting: AtomicBool::new(false),
            manual_close: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        inner.establish().await?;
        inner.prime_authorize().await;
        Ok(Self { inner })
    }

    /// Sends a message and resolves with the response payload.
    pub async fn send(&self, msg_type: &str, payload: Value) -> Result<Value, ClientError> {
        self.inner.send(msg_type, payload).await
    }

    /// Uploads a file in chunks and resolves with the server
    /// application's payload.
    pub async fn send_file(
        &self,
        msg_type: &str,
        file: Vec<u8>,
        payload: Value,
    ) -> Result<Value, ClientError> {
        crate::upload::send_file(&self.inner, msg_type, file, payload).await
    }

    /// `true` while the link is up.
    pub async fn is_open(&self) -> bool {
        matches!(&*self.inner.link.lock().await, Link::Open(tx) if !tx.is_closed())
    }

    /// Closes the connection for good; no reconnection follows.
    pub async fn close(&self) {
        self.inner.manual_close.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        let mut link = self.inner.link.lock().await;
        if let Link::Open(tx) = &*link {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let _ = tx.try_send(WsMessage::Close(Some(frame)));
        }
        *link = Link::Closed;
    }
}

pub(crate) struct ClientInner<H> {
    pub(crate) config: ClientConfig,
    pub(crate) handler: Arc<H>,
    pub(crate) link: Mutex<Link>,
    /// Resolvers waiting for a response, keyed by message id. Upload
    /// completions wait here too, keyed by file id.
    pub(crate) pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    /// Messages issued while the link was down, in send order.
    pub(crate) text_queue: Mutex<VecDeque<String>>,
    /// Chunk frames whose send attempt found the link down.
    pub(crate) chunk_queue: Mutex<VecDeque<QueuedChunk>>,
    /// Id of the in-flight `authorize` request; its response goes to
    /// `on_auth` instead of the pending table.
    pub(crate) auth_request_id: Mutex<Option<String>>,
    /// File ids of uploads still in flight.
    pub(crate) jobs: Mutex<HashSet<String>>,
    pub(crate) reconnecting: AtomicBool,
    pub(crate) manual_close: AtomicBool,
    pub(crate) terminated: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl<H: ClientHandler> ClientInner<H> {
    /// Dials the server and spawns the read/write pumps.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        *self.link.lock().await = Link::Connecting;

        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);

        let connected = tokio_tungstenite::connect_async_with_config(
            self.config.api_url.as_str(),
            Some(ws_config),
            false,
        )
        .await;

        let (ws_stream, _) = match connected {
            Ok(ok) => ok,
            Err(e) => {
                *self.link.lock().await = Link::Closed;
                return Err(e.into());
            }
        };

        let (ws_sink, ws_read) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);

        tokio::spawn(write_pump(ws_sink, rx, self.cancel.clone()));
        tokio::spawn(read_pump(Arc::clone(self), ws_read, tx.clone()));

        *self.link.lock().await = Link::Open(tx);
        if !self.config.disable_logs {
            tracing::info!(url = %self.config.api_url, "connected");
        }
        Ok(())
    }

    /// Emits the `authorize` message first on a fresh link. Its response
    /// is routed to `on_auth` by the read pump.
    pub(crate) async fn prime_authorize(self: &Arc<Self>) {
        let msg = Message::new(
            TYPE_AUTHORIZE,
            self.config.auth_request_payload.clone(),
        );
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("cannot serialize authorize message: {e}");
                return;
            }
        };

        *self.auth_request_id.lock().await = Some(msg.message_id.clone());
        self.emit_or_queue_text(json).await;
    }

    /// Sends a message and awaits the matching response.
    pub(crate) async fn send(
        self: &Arc<Self>,
        msg_type: &str,
        payload: Value,
    ) -> Result<Value, ClientError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let msg = Message::new(msg_type, payload);
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg.message_id.clone(), tx);
        self.emit_or_queue_text(json).await;

        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Writes a text frame, or queues it when the link is down.
    pub(crate) async fn emit_or_queue_text(self: &Arc<Self>, json: String) {
        let mut trigger = false;
        {
            let link = self.link.lock().await;
            match &*link {
                Link::Open(tx) => {
                    if let Err(err) = tx.try_send(WsMessage::Text(json)) {
                        if let WsMessage::Text(json) = err.into_inner() {
                            self.text_queue.lock().await.push_back(json);
                        }
                    }
                }
                Link::Connecting => {
                    self.text_queue.lock().await.push_back(json);
                }
                Link::Closed => {
                    self.text_queue.lock().await.push_back(json);
                    trigger = true;
                }
            }
        }
        if trigger {
            self.trigger_reconnect();
        }
    }

    /// Writes a chunk frame, or queues it when the link is down.
    pub(crate) async fn emit_or_queue_chunk(self: &Arc<Self>, chunk: QueuedChunk) {
        let QueuedChunk { file_id, frame } = chunk;
        let mut trigger = false;
        {
            let link = self.link.lock().await;
            match &*link {
                Link::Open(tx) => {
                    if let Err(err) = tx.try_send(WsMessage::Binary(frame)) {
                        if let WsMessage::Binary(frame) = err.into_inner() {
                            self.chunk_queue
                                .lock()
                                .await
                                .push_back(QueuedChunk { file_id, frame });
                        }
                    }
                }
                Link::Connecting => {
                    self.chunk_queue
                        .lock()
                        .await
                        .push_back(QueuedChunk { file_id, frame });
                }
                Link::Closed => {
                    self.chunk_queue
                        .lock()
                        .await
                        .push_back(QueuedChunk { file_id, frame });
                    trigger = true;
                }
            }
        }
        if trigger {
            self.trigger_reconnect();
        }
    }

    /// Flushes everything queued while the link was down: text messages
    /// first, then chunks of uploads that are still alive.
    pub(crate) async fn flush_queues(self: &Arc<Self>) {
        let texts: Vec<String> = self.text_queue.lock().await.drain(..).collect();
        for json in texts {
            self.emit_or_queue_text(json).await;
        }

        let chunks: Vec<QueuedChunk> = self.chunk_queue.lock().await.drain(..).collect();
        let jobs = self.jobs.lock().await.clone();
        for chunk in chunks {
            if jobs.contains(&chunk.file_id) {
                self.emit_or_queue_chunk(chunk).await;
            }
        }
    }

    /// Routes one inbound text frame: resolve a pending request and,
    /// independently, dispatch updates to the handler. Hooks run here in
    /// the read pump, so application calls stay serialized per
    /// connection.
    pub(crate) async fn handle_text(self: &Arc<Self>, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("dropping unparseable message: {e}");
                return;
            }
        };

        let is_auth_response = {
            let mut auth_id = self.auth_request_id.lock().await;
            if auth_id.as_deref() == Some(msg.message_id.as_str()) {
                auth_id.take();
                true
            } else {
                false
            }
        };
        if is_auth_response {
            self.handler.on_auth(msg.payload.clone()).await;
        }

        if let Some(tx) = self.pending.lock().await.remove(&msg.message_id) {
            let _ = tx.send(msg.payload.clone());
        }

        if msg.msg_type.is_some() {
            self.handler.on_message(msg).await;
        }
    }

    /// Reacts to an unexpected link loss.
    pub(crate) async fn on_disconnect(self: &Arc<Self>) {
        if self.manual_close.load(Ordering::SeqCst) || self.terminated.load(Ordering::SeqCst) {
            return;
        }
        *self.link.lock().await = Link::Closed;
        if !self.config.disable_logs {
            tracing::warn!("connection lost");
        }
        self.trigger_reconnect();
    }

    /// Spawns the reconnect loop unless one is already running.
    pub(crate) fn trigger_reconnect(self: &Arc<Self>) {
        if self.terminated.load(Ordering::SeqCst) || self.manual_close.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(crate::reconnect::reconnect_loop(Arc::clone(self)));
    }

    /// Drops all state of a failed upload job.
    pub(crate) async fn fail_upload(&self, file_id: &str) {
        self.pending.lock().await.remove(file_id);
        self.jobs.lock().await.remove(file_id);
        self.chunk_queue
            .lock()
            .await
            .retain(|c| c.file_id != file_id);
    }

    /// Terminal close: rejects everything still outstanding.
    pub(crate) async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        *self.link.lock().await = Link::Closed;
        // Dropping the senders rejects every waiting future.
        self.pending.lock().await.clear();
        self.text_queue.lock().await.clear();
        self.chunk_queue.lock().await.clear();
        self.jobs.lock().await.clear();
    }
}

#[cfg(test)]
impl<H: ClientHandler> ClientInner<H> {
    pub(crate) fn stub(handler: H, link: Link) -> Arc<Self> {
        Arc::new(Self {
            config: ClientConfig {
                api_url: "ws://unused".into(),
                auth_request_payload: serde_json::json!({}),
                disable_logs: true,
            },
            handler: Arc::new(handler),
            link: Mutex::new(link),
            pending: Mutex::new(HashMap::new()),
            text_queue: Mutex::new(VecDeque::new()),
            chunk_queue: Mutex::new(VecDeque::new()),
            auth_request_id: Mutex::new(None),
            jobs: Mutex::new(HashSet::new()),
            reconnecting: AtomicBool::new(false),
            manual_close: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }
}

/// Write pump: drains the send channel into the WebSocket sink.
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
                            tracing::warn!("write pump send error: {e}");
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

/// Read pump: routes inbound frames until the link dies.
async fn read_pump<S, H>(
    inner: Arc<ClientInner<H>>,
    mut stream: S,
    write_tx: mpsc::Sender<WsMessage>,
) where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Send + Unpin,
    H: ClientHandler,
{
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => inner.handle_text(&text).await,
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write_tx.try_send(WsMessage::Pong(data));
                    }
                    Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    inner.on_disconnect().await;
}

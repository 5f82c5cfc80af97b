//! WebSocket listener and connection lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use ctproto_protocol::{generate_id, MAX_MESSAGE_SIZE};

use crate::connection::run_connection;
use crate::handler::Handler;
use crate::registry::ClientRegistry;
use crate::ServerError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind (defaults to `localhost`).
    pub host: String,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Optional mount path; upgrades on any other path are rejected.
    pub path: Option<String>,
    /// Suppresses the engine's informational logs.
    pub disable_logs: bool,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: "localhost".into(),
            port,
            path: None,
            disable_logs: false,
        }
    }
}

/// The CTProto server.
///
/// Accepts WebSocket connections, runs each one through the
/// authorization state machine, and keeps the registry of authorized
/// clients for lookup and broadcast.
pub struct Server<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: ClientRegistry,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> Server<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            registry: ClientRegistry::new(),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// The registry of currently authorized clients.
    pub fn clients(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Returns the bound address once [`run`](Self::run) has started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// The listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        if !self.config.disable_logs {
            tracing::info!("server listening on {local_addr}");
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if !self.config.disable_logs {
                        tracing::info!("server shutting down");
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection to WebSocket and runs it until close.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);

        let mount_path = self.config.path.clone();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match &mount_path {
                Some(path) if req.uri().path() != path => {
                    let reject = http::Response::builder()
                        .status(404)
                        .body(None)
                        .unwrap_or_default();
                    Err(reject)
                }
                _ => Ok(resp),
            }
        };

        let ws_stream =
            accept_hdr_async_with_config(stream, check_path, Some(ws_config)).await?;

        let conn_id = generate_id();
        if !self.config.disable_logs {
            tracing::info!(%peer_addr, conn = %conn_id, "connection established");
        }

        run_connection(
            ws_stream,
            conn_id,
            Arc::clone(&self.handler),
            self.registry.clone(),
            self.config.disable_logs,
            self.cancel.child_token(),
        )
        .await;

        Ok(())
    }
}

//! Registry of authorized clients.
//!
//! A flat collection behind one lock, queried through a fluent cursor:
//! `registry.find(|c| ...).send("update", payload)`. Mutations and
//! queries take the same lock, so `add`/`remove` are atomic with respect
//! to concurrent `find`/`send`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use ctproto_protocol::Message;

use crate::connection::Sender;

/// One authorized connection and its auth data.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Connection id, unique per accepted socket.
    pub id: String,
    /// Opaque value the application returned from `on_auth`.
    pub auth_data: Value,
    pub(crate) sender: Sender,
}

impl ClientRecord {
    /// Handle for pushing messages to this client.
    pub fn sender(&self) -> &Sender {
        &self.sender
    }
}

/// Shared collection of authorized clients.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<Mutex<Vec<ClientRecord>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client record.
    pub async fn add(&self, client: ClientRecord) -> &Self {
        self.inner.lock().await.push(client);
        self
    }

    /// Starts a query over the collection. Terminal operations on the
    /// returned cursor evaluate the predicate under the registry lock.
    pub fn find<'a, F>(&'a self, predicate: F) -> ClientQuery<'a>
    where
        F: Fn(&ClientRecord) -> bool + Send + Sync + 'a,
    {
        ClientQuery {
            registry: self,
            predicate: Box::new(predicate),
        }
    }

    /// Number of registered clients.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Cursor over clients matching a predicate.
pub struct ClientQuery<'a> {
    registry: &'a ClientRegistry,
    predicate: Box<dyn Fn(&ClientRecord) -> bool + Send + Sync + 'a>,
}

impl<'a> ClientQuery<'a> {
    /// `true` if any client matches.
    pub async fn exists(&self) -> bool {
        self.registry
            .inner
            .lock()
            .await
            .iter()
            .any(|c| (self.predicate)(c))
    }

    /// The first matching client, if any.
    pub async fn current(&self) -> Option<ClientRecord> {
        self.registry
            .inner
            .lock()
            .await
            .iter()
            .find(|c| (self.predicate)(c))
            .cloned()
    }

    /// Every matching client.
    pub async fn to_array(&self) -> Vec<ClientRecord> {
        self.registry
            .inner
            .lock()
            .await
            .iter()
            .filter(|c| (self.predicate)(c))
            .cloned()
            .collect()
    }

    /// Closes matched connections, then deletes their records. Removing
    /// an already-removed client is a no-op.
    pub async fn remove(&self) -> &'a ClientRegistry {
        let mut clients = self.registry.inner.lock().await;
        clients.retain(|c| {
            if (self.predicate)(c) {
                let _ = c.sender.close(CloseCode::Normal, "");
                false
            } else {
                true
            }
        });
        self.registry
    }

    /// Builds one update message and emits it to every matched client.
    pub async fn send(&self, msg_type: &str, payload: Value) -> &'a ClientRegistry {
        let msg = Message::new(msg_type, payload);
        for client in self.to_array().await {
            let _ = client.sender.send_msg(&msg);
        }
        self.registry
    }

    /// Sends a close frame to every matched client without touching their
    /// records; the connections remove themselves as they shut down.
    pub async fn close(&self, code: CloseCode, reason: &str) -> &'a ClientRegistry {
        for client in self.to_array().await {
            let _ = client.sender.close(code, reason);
        }
        self.registry
    }
}

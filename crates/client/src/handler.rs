//! Application hooks on the client side.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use ctproto_protocol::Message;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Hooks the engine calls as the connection progresses.
///
/// Both methods default to no-ops, so hosts only override what they
/// care about. `()` implements the trait for callers that want neither.
pub trait ClientHandler: Send + Sync + 'static {
    /// Called with the authorize response payload each time the server
    /// accepts this client (initial connect and every reconnect).
    fn on_auth(&self, payload: Value) -> HandlerFuture<'_> {
        let _ = payload;
        Box::pin(async {})
    }

    /// Called for server-initiated updates: inbound messages that carry a
    /// `type`. An update that also answers a pending request is delivered
    /// here *and* resolves that request.
    fn on_message(&self, message: Message) -> HandlerFuture<'_> {
        let _ = message;
        Box::pin(async {})
    }
}

impl ClientHandler for () {}

impl<T: ClientHandler> ClientHandler for Arc<T> {
    fn on_auth(&self, payload: Value) -> HandlerFuture<'_> {
        T::on_auth(self, payload)
    }

    fn on_message(&self, message: Message) -> HandlerFuture<'_> {
        T::on_message(self, message)
    }
}

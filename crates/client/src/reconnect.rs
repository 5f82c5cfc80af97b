//! Bounded reconnection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ctproto_protocol::{MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY};

use crate::client::ClientInner;
use crate::handler::ClientHandler;

/// Tries to bring the link back up, at most [`MAX_RECONNECT_ATTEMPTS`]
/// times per outage.
///
/// On success the link is re-primed with `authorize` and the queues are
/// flushed (text first, then chunks). On exhaustion the client closes
/// terminally and every outstanding future is rejected.
pub(crate) async fn reconnect_loop<H: ClientHandler>(inner: Arc<ClientInner<H>>) {
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }

        if !inner.config.disable_logs {
            tracing::info!(attempt, "reconnecting");
        }

        match inner.establish().await {
            Ok(()) => {
                inner.prime_authorize().await;
                inner.flush_queues().await;
                inner.reconnecting.store(false, Ordering::SeqCst);
                if !inner.config.disable_logs {
                    tracing::info!(attempt, "reconnected");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }

    tracing::warn!("reconnect attempts exhausted, closing client");
    inner.terminate().await;
    inner.reconnecting.store(false, Ordering::SeqCst);
}

//! Real-time change notifications for display clients.
//!
//! Each client holds a WebSocket on the notifications port. The
//! [`ClientRegistry`] owns the set of open connections and is shared with the
//! content watcher, which calls [`ClientRegistry::broadcast`] for every event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::events::ChangeEvent;

pub type ClientId = Uuid;

/// Outbound half of a client connection.
pub type ClientSender = mpsc::UnboundedSender<Arc<str>>;

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
}

/// Open notification clients.
///
/// Membership is implicit: [`register`](Self::register) on connect, and
/// removal happens when a broadcast finds the client closed. Nothing is queued
/// for clients that are not connected.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientSender>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client and returns the receiver its connection task drains.
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<Arc<str>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sends `event` to every open client. Closed clients are skipped and dropped.
    pub fn broadcast(&self, event: &ChangeEvent) -> BroadcastReport {
        let message: Arc<str> = Arc::from(event.to_message());
        let mut report = BroadcastReport::default();
        let mut clients = self.lock();
        clients.retain(|id, sender| {
            if sender.is_closed() || sender.send(Arc::clone(&message)).is_err() {
                trace!(client = %id, "pruning closed notification client");
                report.skipped += 1;
                false
            } else {
                report.delivered += 1;
                true
            }
        });
        debug!(
            delivered = report.delivered,
            skipped = report.skipped,
            message = %message,
            "broadcast change"
        );
        report
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientSender>> {
        // Sends never panic while the lock is held, so a poisoned map is still consistent.
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn router(registry: Arc<ClientRegistry>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(registry)
}

/// Serves the notification endpoint on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    info!(?addr, "notification channel listening");
    axum::serve(listener, router(registry).into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("notification server exited")?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<ClientRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<ClientRegistry>) {
    let (id, mut rx) = registry.register();
    info!(client = %id, "display client connected");

    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.as_ref().into())).await.is_err() {
                break;
            }
        }
    });

    // Clients have nothing to say; read only to notice the close.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(client = %id, error = %err, "notification socket error");
                break;
            }
        }
    }

    // Dropping the receiver marks the client closed; the next broadcast prunes it.
    send_task.abort();
    info!(client = %id, "display client disconnected");
}

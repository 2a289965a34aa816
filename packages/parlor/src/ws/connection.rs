//! A single client connection.
//!
//! Each connection runs two tasks over the split WebSocket:
//! - inbound: read frames, decode envelopes, route them through the registry
//! - outbound: drain the outbound queue to the socket and send keepalive pings
//!
//! The tasks share a close signal. Whichever one exits first runs the
//! idempotent teardown, which fires the signal so the other one follows.

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{MalformedPolicy, WebSocketConfig};

use super::error::RelayError;
use super::protocol::Event;
use super::registry::ConnectionRegistry;

pub type ConnectionId = Uuid;

pub struct Connection {
    id: ConnectionId,
    registry: Weak<ConnectionRegistry>,
    /// Written only by this connection's inbound task, read by broadcasts.
    room: RwLock<String>,
    outbound: mpsc::Sender<Event>,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        registry: Weak<ConnectionRegistry>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            registry,
            room: RwLock::new(String::new()),
            outbound,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// A connection with no registry behind it.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Event>) {
        Self::new(Weak::new(), capacity)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn registry(&self) -> Option<Arc<ConnectionRegistry>> {
        self.registry.upgrade()
    }

    pub async fn room(&self) -> String {
        self.room.read().await.clone()
    }

    pub async fn in_room(&self, room: &str) -> bool {
        *self.room.read().await == room
    }

    pub async fn set_room(&self, name: String) {
        *self.room.write().await = name;
    }

    /// Queue an event for the outbound task without waiting.
    pub(crate) fn enqueue(&self, event: Event) -> Result<(), mpsc::error::TrySendError<Event>> {
        if self.is_closed() {
            return Err(mpsc::error::TrySendError::Closed(event));
        }
        self.outbound.try_send(event)
    }

    /// Signal both tasks to stop. The outbound task sends a close frame on its
    /// way out.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the transport and unregister. Safe to call any number of times
    /// from either task.
    pub async fn teardown(&self) {
        self.close();
        if let Some(registry) = self.registry() {
            registry.remove(self.id).await;
        }
    }

    /// Spawn the inbound and outbound tasks.
    pub(crate) fn start<S, Si>(
        self: &Arc<Self>,
        stream: S,
        sink: Si,
        outbound: mpsc::Receiver<Event>,
        settings: &WebSocketConfig,
    ) -> (JoinHandle<()>, JoinHandle<()>)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
    {
        let inbound = {
            let conn = Arc::clone(self);
            let pong_wait = settings.pong_wait;
            let policy = settings.on_malformed;
            tokio::spawn(async move {
                let result = read_loop(&conn, stream, pong_wait, policy).await;
                conn.finish("inbound", result).await;
            })
        };

        let outbound = {
            let conn = Arc::clone(self);
            let ping_interval = settings.ping_interval;
            tokio::spawn(async move {
                let result = write_loop(&conn, sink, outbound, ping_interval).await;
                conn.finish("outbound", result).await;
            })
        };

        (inbound, outbound)
    }

    async fn finish(&self, side: &str, result: Result<(), RelayError>) {
        match result {
            Ok(()) => debug!(conn_id = %self.id, side, "Connection task finished"),
            Err(e) => {
                info!(conn_id = %self.id, side, "Connection task ended: {}", e);
                if let Some(registry) = self.registry() {
                    registry.metrics().websocket_error();
                }
            }
        }
        self.teardown().await;
    }
}

/// Inbound side. Returns `Ok` on an orderly close, `Err` with the reason
/// otherwise.
///
/// The read deadline starts at `now + pong_wait` and only a pong pushes it out.
async fn read_loop<S>(
    conn: &Arc<Connection>,
    mut stream: S,
    pong_wait: std::time::Duration,
    policy: MalformedPolicy,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            _ = conn.closed.cancelled() => return Ok(()),
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => return Err(RelayError::KeepaliveTimeout(pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        let decoded = match msg {
            Message::Text(text) => Event::from_frame(text.as_bytes()),
            Message::Binary(data) => Event::from_frame(&data),
            Message::Pong(_) => {
                trace!(conn_id = %conn.id, "pong");
                deadline = Instant::now() + pong_wait;
                continue;
            }
            // The WebSocket layer answers pings on its own.
            Message::Ping(_) => continue,
            Message::Close(frame) => {
                debug!(conn_id = %conn.id, ?frame, "Peer closed connection");
                return Ok(());
            }
        };

        let Some(registry) = conn.registry() else {
            return Ok(());
        };

        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                registry.metrics().malformed_frame();
                match policy {
                    MalformedPolicy::Drop => {
                        warn!(conn_id = %conn.id, "Dropping malformed frame: {}", e);
                        continue;
                    }
                    MalformedPolicy::Disconnect => return Err(e),
                }
            }
        };

        registry.metrics().message_received();
        if let Err(e) = registry.route(event, conn).await {
            registry.metrics().handler_error();
            warn!(conn_id = %conn.id, "Error handling event: {}", e);
        }
    }
}

/// Outbound side. Owns the sink; the only place frames are written.
async fn write_loop<Si>(
    conn: &Arc<Connection>,
    mut sink: Si,
    mut outbound: mpsc::Receiver<Event>,
    ping_interval: std::time::Duration,
) -> Result<(), RelayError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => {
                send_close(conn, &mut sink).await;
                return Ok(());
            }
            next = outbound.recv() => {
                let Some(event) = next else {
                    send_close(conn, &mut sink).await;
                    return Ok(());
                };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!(conn_id = %conn.id, "Failed to serialize {} event: {}", event.kind, e);
                        continue;
                    }
                };
                // A failed write is not fatal here; the next ping will tell.
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!(conn_id = %conn.id, "Failed to send {} event: {}", event.kind, e);
                }
            }
            _ = ticker.tick() => {
                trace!(conn_id = %conn.id, "ping");
                sink.send(Message::Ping(Bytes::new()))
                    .await
                    .map_err(|e| RelayError::Transport(format!("ping failed: {e}")))?;
            }
        }
    }
}

async fn send_close<Si>(conn: &Connection, sink: &mut Si)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(conn_id = %conn.id, "Close frame not delivered: {}", e);
    }
}

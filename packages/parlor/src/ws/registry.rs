//! Connection registry.
//!
//! Owns the live connection set, the dispatch table, the ticket store and the
//! credential verifier. Nothing outside this module iterates or mutates the
//! connection set.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::StreamExt;
use parlor_tickets::{Ticket, TicketStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, CredentialVerifier};
use crate::config::{OverflowPolicy, WebSocketConfig};
use crate::metrics::ServerMetrics;

use super::connection::{Connection, ConnectionId};
use super::dispatch::DispatchTable;
use super::error::RelayError;
use super::protocol::Event;

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    dispatch: DispatchTable,
    tickets: TicketStore,
    credentials: Arc<dyn CredentialVerifier>,
    settings: WebSocketConfig,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionRegistry {
    pub fn new(
        dispatch: DispatchTable,
        tickets: TicketStore,
        credentials: Arc<dyn CredentialVerifier>,
        settings: WebSocketConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            dispatch,
            tickets,
            credentials,
            settings,
            metrics,
        })
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    #[cfg(test)]
    pub fn settings(&self) -> &WebSocketConfig {
        &self.settings
    }

    // =========================================================================
    // Tickets
    // =========================================================================

    /// Check credentials and mint a ticket for one upgrade.
    pub async fn issue_ticket(&self, username: &str, password: &str) -> Result<Ticket, AuthError> {
        if !self.credentials.verify(username, password) {
            warn!(username, "Rejected login");
            return Err(AuthError::InvalidCredentials);
        }
        let ticket = self.tickets.mint().await;
        self.metrics.ticket_issued();
        debug!(username, "Issued ticket");
        Ok(ticket)
    }

    /// Consume a ticket. Fails for unknown, expired and already used keys.
    pub async fn admit(&self, ticket: &str) -> Result<(), AuthError> {
        if self.tickets.verify(ticket).await {
            Ok(())
        } else {
            self.metrics.ticket_rejected();
            Err(AuthError::InvalidTicket)
        }
    }

    /// Spend `ticket` and upgrade. Nothing is created when the ticket is
    /// rejected.
    pub async fn upgrade(
        self: &Arc<Self>,
        ticket: &str,
        ws: WebSocketUpgrade,
    ) -> Result<Response, AuthError> {
        self.admit(ticket).await?;

        let registry = Arc::clone(self);
        let metrics = Arc::clone(&self.metrics);
        Ok(ws
            .max_message_size(self.settings.max_frame_bytes)
            .max_frame_size(self.settings.max_frame_bytes)
            .on_failed_upgrade(move |e| {
                metrics.websocket_error();
                warn!("WebSocket upgrade failed: {}", e);
            })
            .on_upgrade(move |socket| async move {
                registry.connect(socket).await;
            }))
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Build an unregistered connection bound to this registry.
    pub(crate) fn open(self: &Arc<Self>) -> (Arc<Connection>, mpsc::Receiver<Event>) {
        Connection::new(Arc::downgrade(self), self.settings.outbound_capacity)
    }

    async fn connect(self: &Arc<Self>, socket: WebSocket) {
        let (conn, rx) = self.open();
        self.add(conn.clone()).await;
        info!(conn_id = %conn.id(), "WebSocket connected");

        let (sink, stream) = socket.split();
        conn.start(stream, sink, rx, &self.settings);
    }

    pub async fn add(&self, conn: Arc<Connection>) {
        self.connections.write().await.insert(conn.id(), conn);
        self.metrics.connection_opened();
    }

    /// Close and forget a connection. Returns false if it was already gone.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id);
        match removed {
            Some(conn) => {
                conn.close();
                self.metrics.connection_closed();
                debug!(conn_id = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Signal every connection to close and empty the set.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, conn) in &drained {
            conn.close();
            self.metrics.connection_closed();
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    pub async fn route(&self, event: Event, conn: &Arc<Connection>) -> Result<(), RelayError> {
        self.dispatch.route(&event, conn).await
    }

    /// Enqueue `event` for every connection in `room`. Returns how many
    /// recipients it reached.
    ///
    /// Iterates a snapshot, so connections joining or leaving meanwhile do not
    /// block on the broadcast.
    pub async fn broadcast(&self, room: &str, event: Event) -> usize {
        let snapshot: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for conn in snapshot {
            if !conn.in_room(room).await {
                continue;
            }
            match conn.enqueue(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.message_dropped();
                    warn!(conn_id = %conn.id(), room, "Outbound queue full, dropping event");
                    if self.settings.on_overflow == OverflowPolicy::Disconnect {
                        stalled.push(conn.id());
                    }
                }
                // Already tearing down.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        for id in stalled {
            info!(conn_id = %id, "Disconnecting stalled connection");
            self.remove(id).await;
        }

        self.metrics.messages_broadcast(delivered as u64);
        delivered
    }

    /// Connection count per room, for `/health`. Connections that have not
    /// joined a room yet are left out.
    pub async fn room_populations(&self) -> BTreeMap<String, usize> {
        let snapshot: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();

        let mut rooms = BTreeMap::new();
        for conn in snapshot {
            let room = conn.room().await;
            if !room.is_empty() {
                *rooms.entry(room).or_insert(0) += 1;
            }
        }
        rooms
    }
}

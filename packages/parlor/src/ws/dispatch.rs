//! Event dispatch table.
//!
//! Maps an envelope's `type` to the handler for that kind. The table is built
//! once when the registry is created and never changes afterwards, so routing
//! needs no locking.

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::connection::Connection;
use super::error::RelayError;
use super::protocol::{
    ChangeRoomPayload, EVENT_CHANGE_ROOM, EVENT_NEW_MESSAGE, EVENT_SEND_MESSAGE, Event,
    NewMessagePayload, SendMessagePayload,
};

pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), RelayError>>;

/// A handler receives the event and the connection it arrived on.
pub type EventHandler = for<'a> fn(&'a Event, &'a Arc<Connection>) -> HandlerFuture<'a>;

pub struct DispatchTable {
    handlers: HashMap<&'static str, EventHandler>,
}

impl DispatchTable {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The client-facing protocol: `send_message` and `change_room`.
    pub fn standard() -> Self {
        Self::empty()
            .with(EVENT_SEND_MESSAGE, send_message)
            .with(EVENT_CHANGE_ROOM, change_room)
    }

    pub fn with(mut self, kind: &'static str, handler: EventHandler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    #[cfg(test)]
    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Run the handler registered for `event.kind`. Unknown kinds are an error,
    /// never silently ignored. Handler errors are returned as-is.
    pub async fn route(&self, event: &Event, conn: &Arc<Connection>) -> Result<(), RelayError> {
        let handler = self
            .handlers
            .get(event.kind.as_str())
            .ok_or_else(|| RelayError::UnknownEventKind(event.kind.clone()))?;
        handler(event, conn).await
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// `change_room {name}`: move the connection. Nothing else changes.
fn change_room<'a>(event: &'a Event, conn: &'a Arc<Connection>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let ChangeRoomPayload { name } = event.decode_payload()?;
        debug!(conn_id = %conn.id(), room = %name, "Changing room");
        conn.set_room(name).await;
        Ok(())
    })
}

/// `send_message {message, from}`: stamp it and fan it out to the sender's room
/// as `new_message`.
fn send_message<'a>(event: &'a Event, conn: &'a Arc<Connection>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let SendMessagePayload { message, from } = event.decode_payload()?;
        let registry = conn
            .registry()
            .ok_or_else(|| RelayError::Handler("connection registry has shut down".into()))?;

        let outgoing = Event::new(
            EVENT_NEW_MESSAGE,
            NewMessagePayload {
                message,
                from,
                sent: Utc::now(),
            },
        )?;

        let room = conn.room().await;
        let delivered = registry.broadcast(&room, outgoing).await;
        debug!(conn_id = %conn.id(), room = %room, delivered, "Broadcast message");
        Ok(())
    })
}

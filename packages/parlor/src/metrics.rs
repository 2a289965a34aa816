//! Server metrics for observability
//!
//! Plain atomic counters, snapshotted into serializable structs for `/metrics`
//! and `/health`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently registered WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Envelopes received from clients (well-formed only)
    pub messages_received: AtomicU64,
    /// Events enqueued onto recipients' outbound queues
    pub messages_broadcast: AtomicU64,
    /// Events dropped because a recipient's queue was full
    pub messages_dropped: AtomicU64,

    // Error metrics
    /// Frames that did not decode into an envelope
    pub malformed_frames: AtomicU64,
    /// Envelopes a handler rejected (bad payload, unknown kind, ...)
    pub handler_errors: AtomicU64,
    /// Connections that ended on a transport error or keepalive timeout
    pub websocket_errors: AtomicU64,

    // Ticket metrics
    pub tickets_issued: AtomicU64,
    /// Upgrade attempts refused for a missing, unknown or spent ticket
    pub tickets_rejected: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_broadcast(&self, count: u64) {
        self.messages_broadcast.fetch_add(count, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Ticket tracking
    pub fn ticket_issued(&self) {
        self.tickets_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticket_rejected(&self) {
        self.tickets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                broadcast: self.messages_broadcast.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
                handler: self.handler_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
            tickets: TicketMetrics {
                issued: self.tickets_issued.load(Ordering::Relaxed),
                rejected: self.tickets_rejected.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
    pub tickets: TicketMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub broadcast: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub malformed_frames: u64,
    pub handler: u64,
    pub websocket: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMetrics {
    pub issued: u64,
    pub rejected: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    /// Connection count per room
    pub rooms: BTreeMap<String, usize>,
    pub outstanding_tickets: usize,
    pub uptime_secs: u64,
}

//! Single-use connection tickets for Parlor.
//!
//! A ticket is minted after credentials check out, handed to the client, and
//! presented exactly once when the client opens its WebSocket. Tickets that are
//! never presented are swept out by a background task once their retention
//! period has elapsed.

pub mod store;

pub use store::{DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL, Ticket, TicketConfig, TicketStore};

//! WebSocket relay
//!
//! Clients exchange `{type, payload}` envelopes over a single connection:
//! - `change_room` moves the connection into a room
//! - `send_message` fans a `new_message` out to everyone in the sender's room
//!
//! Each connection is a pair of tasks (see [`connection`]) registered with the
//! [`ConnectionRegistry`].

mod connection;
pub(crate) mod dispatch;
mod error;
pub mod protocol;
mod registry;

pub use dispatch::DispatchTable;
pub use registry::ConnectionRegistry;

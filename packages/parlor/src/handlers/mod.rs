pub mod health;
pub mod login;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use login::login_handler;
pub use websocket::websocket_handler;

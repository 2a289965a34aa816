use std::sync::Arc;
use tokio::sync::mpsc;

use parlor_tickets::{TicketConfig, TicketStore};

use crate::AppState;
use crate::auth::StaticCredentials;
use crate::config::{FileConfig, RelayConfig, WebSocketConfig};
use crate::metrics::ServerMetrics;
use crate::ws::protocol::Event;
use crate::ws::{ConnectionRegistry, DispatchTable};

/// Registry with default limits, the standard dispatch table and the
/// `percy` / `123` account.
pub fn test_registry() -> Arc<ConnectionRegistry> {
    test_registry_with(WebSocketConfig::default())
}

pub fn test_registry_with(settings: WebSocketConfig) -> Arc<ConnectionRegistry> {
    ConnectionRegistry::new(
        DispatchTable::standard(),
        TicketStore::new(TicketConfig::default()),
        Arc::new(StaticCredentials::new("percy", "123")),
        settings,
        Arc::new(ServerMetrics::new()),
    )
}

/// Next queued outbound event, if any, without waiting.
pub fn try_recv_event(rx: &mut mpsc::Receiver<Event>) -> Option<Event> {
    rx.try_recv().ok()
}

/// Fully-wired `AppState` built from `fc`, the way `parlor server` builds it.
pub fn test_app_state(fc: &FileConfig) -> AppState {
    let config = Arc::new(RelayConfig::from_file(fc).expect("valid test config"));
    AppState::new(config)
}

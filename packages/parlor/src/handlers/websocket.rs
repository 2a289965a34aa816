use axum::{
    extract::{
        Query, State, WebSocketUpgrade, rejection::QueryRejection,
        ws::rejection::WebSocketUpgradeRejection,
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;
use crate::auth::AuthError;

#[derive(Debug, Deserialize)]
pub struct UpgradeParams {
    pub ticket: Option<String>,
}

/// GET /ws?ticket=<key>
///
/// Checks run cheapest first, and the ticket is only spent once everything
/// else has passed: a rejected origin or a request that is not a WebSocket
/// handshake leaves the ticket usable.
pub async fn websocket_handler(
    State(state): State<AppState>,
    params: Result<Query<UpgradeParams>, QueryRejection>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // An unparseable query carries no usable ticket either.
    let ticket = params.ok().and_then(|Query(params)| params.ticket);
    let Some(ticket) = ticket.filter(|t| !t.is_empty()) else {
        state.metrics.ticket_rejected();
        return AuthError::MissingTicket.into_response();
    };

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !state.config.server.origin_allowed(origin) {
        let origin = origin.unwrap_or("<none>").to_string();
        warn!(%origin, "Rejected WebSocket origin");
        return AuthError::OriginNotAllowed(origin).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    match state.registry.upgrade(&ticket, ws).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Rejected WebSocket upgrade: {}", e);
            e.into_response()
        }
    }
}

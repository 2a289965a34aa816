use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Single-use key for `GET /ws?ticket=...`.
    pub ticket: String,
}

/// POST /login - trade credentials for a WebSocket ticket
pub async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Response {
    match state
        .registry
        .issue_ticket(&req.username, &req.password)
        .await
    {
        Ok(ticket) => Json(LoginResponse { ticket: ticket.key }).into_response(),
        Err(e) => e.into_response(),
    }
}

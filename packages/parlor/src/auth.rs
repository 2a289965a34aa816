//! Authentication at the HTTP edge: credential checks for ticket issuance and
//! the error responses for rejected logins and upgrades.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::config::AuthConfig;

// =============================================================================
// Credential verification
// =============================================================================

/// Decides whether a username/password pair may receive a ticket.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Single account taken from `[auth]` in the config.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.username.clone(), config.password.clone())
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        !self.username.is_empty() && username == self.username && password == self.password
    }
}

// =============================================================================
// Auth Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing ticket")]
    MissingTicket,

    #[error("invalid, expired or already used ticket")]
    InvalidTicket,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),
}

impl IntoResponse for AuthError {
    /// Rejections carry no body: the status code is the whole answer.
    fn into_response(self) -> Response {
        match self {
            AuthError::MissingTicket | AuthError::InvalidTicket | AuthError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED.into_response()
            }
            AuthError::OriginNotAllowed(_) => StatusCode::FORBIDDEN.into_response(),
        }
    }
}

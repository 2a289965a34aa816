use std::time::Duration;

/// Errors on the per-connection path.
///
/// Only `Transport` and `KeepaliveTimeout` always end a connection. `Decode`
/// ends it when the malformed-frame policy says so; everything else drops the
/// offending message and keeps the connection open.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("bad {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} event: {source}")]
    Encode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown event kind: {0:?}")]
    UnknownEventKind(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no pong within {0:?}")]
    KeepaliveTimeout(Duration),
}

impl From<axum::Error> for RelayError {
    fn from(err: axum::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

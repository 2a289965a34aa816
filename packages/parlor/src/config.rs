use anyhow::{Result, bail};
use parlor_tickets::TicketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / parlor.toml / env vars)
// =============================================================================
//
//   parlor.toml:     [keepalive]
//                    pong_wait_ms = 10000
//
//   env var:         PARLOR_KEEPALIVE__PONG_WAIT_MS=10000   (double underscore = nesting)

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "parlor.toml";

/// What to do with a frame that is not a valid envelope.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Log and discard the frame; the connection stays open.
    #[default]
    Drop,
    /// Tear the connection down.
    Disconnect,
}

/// What to do when a recipient's outbound queue is full during broadcast.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the event for that recipient only.
    #[default]
    Drop,
    /// Disconnect the stalled recipient.
    Disconnect,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub keepalive: KeepaliveFileConfig,
    #[serde(default)]
    pub tickets: TicketsFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed to open a WebSocket. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Credentials accepted by `/login` (lives under `[auth]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
        }
    }
}

/// Ping/pong timing (lives under `[keepalive]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepaliveFileConfig {
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    /// Defaults to 90% of `pong_wait_ms`.
    #[serde(default)]
    pub ping_interval_ms: Option<u64>,
}

impl Default for KeepaliveFileConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait_ms(),
            ping_interval_ms: None,
        }
    }
}

/// Ticket lifetime (lives under `[tickets]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TicketsFileConfig {
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TicketsFileConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Per-connection limits (lives under `[websocket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default)]
    pub on_malformed: MalformedPolicy,
    #[serde(default)]
    pub on_overflow: OverflowPolicy,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            outbound_capacity: default_outbound_capacity(),
            on_malformed: MalformedPolicy::default(),
            on_overflow: OverflowPolicy::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
// Placeholder account; real deployments override it in parlor.toml.
fn default_username() -> String {
    "percy".to_string()
}
fn default_password() -> String {
    "123".to_string()
}
fn default_pong_wait_ms() -> u64 {
    10_000
}
fn default_retention_ms() -> u64 {
    5_000
}
fn default_sweep_interval_ms() -> u64 {
    400
}
fn default_max_frame_bytes() -> usize {
    512
}
fn default_outbound_capacity() -> usize {
    64
}

/// Build a figment that layers: defaults → config file → PARLOR_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PARLOR_SERVER__PORT=9000`  →  `server.port = 9000`
///   `PARLOR_WEBSOCKET__ON_MALFORMED=disconnect`  →  `websocket.on_malformed = "disconnect"`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PARLOR_").split("__"))
}

/// Values from the command line, applied on top of the file config.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl CliOverrides {
    pub fn apply(&self, fc: &mut FileConfig) {
        if let Some(host) = &self.host {
            fc.server.host = host.clone();
        }
        if let Some(port) = self.port {
            fc.server.port = port;
        }
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub websocket: WebSocketConfig,
    pub tickets: TicketConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse::<SocketAddr>()?)
    }

    /// Requests without an `Origin` header (non-browser clients) are only
    /// accepted when no allow-list is configured.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
            None => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// How long to wait for a pong (or any frame) before giving up on a peer.
    pub pong_wait: Duration,
    /// How often to ping; always shorter than `pong_wait`.
    pub ping_interval: Duration,
    pub max_frame_bytes: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    pub on_malformed: MalformedPolicy,
    pub on_overflow: OverflowPolicy,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        let keepalive = KeepaliveFileConfig::default();
        let pong_wait = Duration::from_millis(keepalive.pong_wait_ms);
        Self {
            pong_wait,
            ping_interval: pong_wait * 9 / 10,
            max_frame_bytes: default_max_frame_bytes(),
            outbound_capacity: default_outbound_capacity(),
            on_malformed: MalformedPolicy::default(),
            on_overflow: OverflowPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        if fc.keepalive.pong_wait_ms == 0 {
            bail!("keepalive.pong_wait_ms must be greater than zero");
        }
        let pong_wait = Duration::from_millis(fc.keepalive.pong_wait_ms);
        let ping_interval = match fc.keepalive.ping_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => pong_wait * 9 / 10,
        };
        if ping_interval.is_zero() || ping_interval >= pong_wait {
            bail!(
                "keepalive.ping_interval_ms ({}) must be between 1 and pong_wait_ms ({})",
                ping_interval.as_millis(),
                fc.keepalive.pong_wait_ms
            );
        }
        if fc.tickets.sweep_interval_ms == 0 {
            bail!("tickets.sweep_interval_ms must be greater than zero");
        }
        if fc.websocket.outbound_capacity == 0 {
            bail!("websocket.outbound_capacity must be greater than zero");
        }
        if fc.websocket.max_frame_bytes == 0 {
            bail!("websocket.max_frame_bytes must be greater than zero");
        }

        Ok(Self {
            server: ServerConfig {
                host: fc.server.host.clone(),
                port: fc.server.port,
                allowed_origins: fc.server.allowed_origins.clone(),
            },
            auth: AuthConfig {
                username: fc.auth.username.clone(),
                password: fc.auth.password.clone(),
            },
            websocket: WebSocketConfig {
                pong_wait,
                ping_interval,
                max_frame_bytes: fc.websocket.max_frame_bytes,
                outbound_capacity: fc.websocket.outbound_capacity,
                on_malformed: fc.websocket.on_malformed,
                on_overflow: fc.websocket.on_overflow,
            },
            tickets: TicketConfig {
                retention: Duration::from_millis(fc.tickets.retention_ms),
                sweep_interval: Duration::from_millis(fc.tickets.sweep_interval_ms),
            },
        })
    }
}

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use parlor_tickets::TicketStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod cli;
mod config;
mod handlers;
mod metrics;
mod ws;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod test_helpers;

use crate::auth::StaticCredentials;
use crate::config::{CliOverrides, FileConfig, RelayConfig};
use crate::metrics::ServerMetrics;
use crate::ws::{ConnectionRegistry, DispatchTable};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri().path(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "parlor")]
#[command(about = "Ticket-authenticated WebSocket chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground
    Server(ServerArgs),

    /// Chat from the terminal through a running relay
    Chat(cli::ChatArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Config file (defaults to ./parlor.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub(crate) fn new(config: Arc<RelayConfig>) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let registry = ConnectionRegistry::new(
            DispatchTable::standard(),
            TicketStore::new(config.tickets),
            Arc::new(StaticCredentials::from_config(&config.auth)),
            config.websocket.clone(),
            metrics.clone(),
        );
        Self {
            registry,
            metrics,
            config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Chat(args) => {
            init_logging("parlor=warn,warn");
            cli::chat_command(args).await
        }
    }
}

fn init_logging(default_directive: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

pub(crate) fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .route("/login", post(handlers::login_handler))
        .route("/ws", get(handlers::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(cors)
        .with_state(state)
}

/// Permissive when no allow-list is configured, otherwise limited to the
/// listed origins.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid origin in allowed_origins: {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

async fn run_server(args: ServerArgs) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "parlor=debug,tower_http=debug,info"
    } else {
        "parlor=info,tower_http=info,warn"
    };
    init_logging(default_directive);

    let mut file_config: FileConfig = config::load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    CliOverrides {
        host: args.host,
        port: args.port,
    }
    .apply(&mut file_config);
    let config = Arc::new(RelayConfig::from_file(&file_config).context("Invalid configuration")?);

    info!("Starting parlor relay");
    info!(
        "Keepalive: pong_wait={}ms ping_interval={}ms, tickets: retention={}ms sweep={}ms",
        config.websocket.pong_wait.as_millis(),
        config.websocket.ping_interval.as_millis(),
        config.tickets.retention.as_millis(),
        config.tickets.sweep_interval.as_millis(),
    );
    if config.server.allowed_origins.is_empty() {
        info!("Origin check disabled (no allowed_origins configured)");
    } else {
        info!("Allowed origins: {}", config.server.allowed_origins.join(", "));
    }

    let state = AppState::new(config.clone());
    let registry = state.registry.clone();

    let shutdown = CancellationToken::new();
    let sweeper = registry.tickets().spawn_sweeper(shutdown.child_token());

    let app = build_router(state);

    let addr = config.server.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!("Parlor listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  POST   /login            - Exchange credentials for a ticket");
    info!("  GET    /ws?ticket=<key>  - WebSocket connection");
    info!("  GET    /health           - Health summary");
    info!("  GET    /metrics          - Server metrics");

    // Create shutdown signal handler
    let shutdown_signal = {
        let shutdown = shutdown.clone();
        let registry = registry.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, cleaning up...");
            shutdown.cancel();
            let closed = registry.close_all().await;
            info!("Closed {} connections", closed);
        }
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Ticket sweeper ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    server_result
}

//! Beam Arena room server
//!
//! Entry point: loads configuration, connects the token store, and serves:
//! - WebSocket connections for real-time rooms
//! - HTTP control RPCs used by match-making
//! - Health reporting

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beam_arena::app::AppState;
use beam_arena::config::{Config, StoreBackend};
use beam_arena::game::{RegistrySettings, RoomRegistry};
use beam_arena::http::build_router;
use beam_arena::store::{
    run_result_worker, LogResultSink, MemoryTokenStore, ResultPublisher, ResultSink,
    SupabaseClient, SupabaseResultSink, SupabaseTokenStore, TokenStore,
};
use beam_arena::util::time::init_server_time;

/// How long shutdown waits for pending match results
const RESULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Beam Arena room server");
    info!("Server address: {}", config.server_addr);

    let (tokens, sink) = connect_stores(&config.store);
    tokens
        .ping()
        .await
        .context("token store unreachable at startup")?;

    // Match results are delivered off the room tasks
    let (publisher, results) = ResultPublisher::channel();
    let result_worker = tokio::spawn(run_result_worker(results, sink));

    let registry = RoomRegistry::new(RegistrySettings::from(&config.game), publisher);
    tokio::spawn(registry.clone().run_reaper());

    let state = AppState::new(config.clone(), registry.clone(), tokens);
    let router = build_router(state);

    let addr = config.server_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.clear();
    drop(registry);
    if tokio::time::timeout(RESULT_DRAIN_TIMEOUT, result_worker)
        .await
        .is_err()
    {
        warn!("Gave up waiting for pending match results");
    }

    info!("Server shutdown complete");
    Ok(())
}

fn connect_stores(backend: &StoreBackend) -> (Arc<dyn TokenStore>, Arc<dyn ResultSink>) {
    match backend {
        StoreBackend::Supabase {
            url,
            service_role_key,
        } => {
            let client = SupabaseClient::new(url, service_role_key);
            info!("Using Supabase token store");
            (
                Arc::new(SupabaseTokenStore::new(client.clone())),
                Arc::new(SupabaseResultSink::new(client)),
            )
        }
        StoreBackend::Memory { room_tokens } => {
            warn!(
                rooms = room_tokens.len(),
                "Using in-memory token store, match results are only logged"
            );
            (
                Arc::new(MemoryTokenStore::with_tokens(room_tokens.clone())),
                Arc::new(LogResultSink),
            )
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}

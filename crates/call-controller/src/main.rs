//! Call Controller
//!
//! Stateful WebSocket signaling server for Brightside uplift calls.
//!
//! # Endpoints
//!
//! One listener (default: 0.0.0.0:4002) serves:
//! - `GET /ws` - WebSocket gateway for heroes and uplifters
//! - `GET /health`, `GET /ready` - Kubernetes probes
//! - `GET /metrics` - Prometheus exposition
//!
//! # Architecture
//!
//! A single `RegistryActor` owns the roster, the user index, and the live
//! call table; one `ConnectionActor` per socket owns the outbound sink.
//! Durable writes (session rows, settlement, deductions) go to Postgres on
//! spawned tasks that rejoin the registry by message.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the Postgres pool and build the stores
//! 4. Spawn the registry actor
//! 5. Bind the listener, start the server, mark ready
//! 6. Wait for shutdown signal, then drain: not-ready, cancel actors,
//!    wait for the registry and the server to stop

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use call_controller::actors::{ActorMetrics, RegistryActor, RegistrySettings};
use call_controller::config::Config;
use call_controller::gateway::{gateway_router, AppState};
use call_controller::observability::metrics::init_metrics_recorder;
use call_controller::observability::{health_router, HealthState};
use call_controller::settlement::SettlementService;
use call_controller::store::postgres::{
    PostgresProfileStore, PostgresSessionStore, PostgresSubscriptionStore,
};
use call_controller::store::{ProfileStore, SessionStore, SubscriptionStore};
use common::secret::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the server task after the registry has drained.
const SERVER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Call Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        listen_address = %config.listen_address,
        db_max_connections = config.db_max_connections,
        call_ceiling_seconds = config.call_ceiling_seconds,
        store_timeout_ms = config.store_timeout_ms,
        mailbox_capacity = config.mailbox_capacity,
        shutdown_timeout_seconds = config.shutdown_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Connect the Postgres pool and build the durable stores
    info!("Connecting to Postgres...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Postgres");
            e
        })?;
    info!("Postgres connection established");

    let sessions: Arc<dyn SessionStore> = Arc::new(PostgresSessionStore::new(pool.clone()));
    let subscriptions: Arc<dyn SubscriptionStore> =
        Arc::new(PostgresSubscriptionStore::new(pool.clone()));
    let profiles: Arc<dyn ProfileStore> = Arc::new(PostgresProfileStore::new(pool));

    let settings = RegistrySettings::from_config(&config);
    let settlement = Arc::new(SettlementService::new(
        Arc::clone(&sessions),
        subscriptions,
        profiles,
        settings.store_timeout,
    ));

    // Initialize actor system
    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let (registry, registry_task) = RegistryActor::spawn(
        settings,
        sessions,
        settlement,
        CancellationToken::new(),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Server shutdown follows the registry's token so one cancel drains
    // the whole instance
    let server_shutdown_token = registry.child_token();

    let app_state = AppState {
        registry: registry.clone(),
        health: Arc::clone(&health_state),
        actor_metrics,
        mailbox_capacity: config.mailbox_capacity,
    };

    // Add /metrics endpoint served by the Prometheus exporter
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = gateway_router(app_state)
        .merge(health_router(Arc::clone(&health_state)))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listen_address = config.listen_address.clone();
    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %listen_address, "Failed to bind gateway listener");
            format!("Failed to bind gateway listener to {listen_address}: {e}")
        })?;
    info!(addr = %listen_address, "Gateway listener bound successfully");

    // Spawn the server task
    let server_addr = listen_address.clone();
    let server_task = tokio::spawn(async move {
        info!(addr = %server_addr, "Gateway server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Gateway server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Gateway server failed");
        }
    });
    info!(addr = %listen_address, "Gateway server started");

    // Admit traffic
    health_state.set_ready();

    // Wait for shutdown signal
    info!("Call Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Cancel the registry; connection actors close their sockets as their
    // child tokens fire, and the server drains once the sockets are gone
    registry.cancel();

    match tokio::time::timeout(config.shutdown_timeout(), registry_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Registry task ended abnormally"),
        Err(_) => warn!(
            timeout_secs = config.shutdown_timeout_seconds,
            "Registry did not drain within the shutdown window"
        ),
    }

    match tokio::time::timeout(SERVER_EXIT_TIMEOUT, server_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Server task ended abnormally"),
        Err(_) => warn!("Gateway server did not stop in time"),
    }

    info!("Call Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

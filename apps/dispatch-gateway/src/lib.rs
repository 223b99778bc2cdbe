//! Dispatch Gateway: the thin HTTP + WebSocket edge that sits in front of
//! `dispatch-engine` (spec §6). Wiring follows `zerg_tasks_worker::run`'s
//! shape — env-aware tracing init, a `watch::channel` shutdown signal, a
//! background health server — generalized from its Redis-worker-plus-
//! health-server split into one Axum app serving the queue/image routes,
//! the `/ws` wire protocol, and the engine's own health/admin router.

mod config;
mod http;
mod state;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use dispatch_engine::{health_router, init_metrics, HealthState, JobDispatchEngine};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use config::Config;
pub use state::AppState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn run() -> Result<()> {
    let config = Config::from_env().wrap_err("failed to load gateway configuration")?;
    core_config::tracing::init_tracing(&config.environment);
    init_metrics();

    info!(address = %config.server.address(), "dispatch-gateway starting");

    let engine = Arc::new(JobDispatchEngine::new(config.engine.clone()));
    engine.start();

    let health_state = HealthState::new(engine.clone(), env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    let app_state = AppState::new(engine.clone());

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(http::router())
        .with_state(app_state)
        .merge(health_router(health_state.clone()))
        .merge(dispatch_engine::admin_router(health_state))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(config.server.address())
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.server.address()))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let server_engine = engine.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.wait_for(|stopping| *stopping).await;
        info!("shutdown signal received, draining in-flight work");
        tokio::time::timeout(SHUTDOWN_GRACE, server_engine.shutdown()).await.ok();
    });

    serve.await.wrap_err("server encountered an error")?;

    info!("dispatch-gateway stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("received SIGTERM, initiating shutdown"),
    }

    Ok(())
}

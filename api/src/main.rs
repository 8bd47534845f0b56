use anyhow::Result;
use common::bootstrap;
use common::config::Settings;
use std::net::SocketAddr;

mod handlers;
mod routes;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    bootstrap::init_human_tracing();

    tracing::info!("Starting batch API server");

    // Load configuration
    let config = Settings::load()?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Configuration loaded"
    );

    // Initialize database connection pool and run migrations
    let db_pool = bootstrap::init_database_pool(&config).await?;
    sqlx::migrate!("../migrations").run(db_pool.pool()).await?;
    tracing::info!("Database migrations applied");

    // Create batch data directories
    bootstrap::init_data_dirs(&config).await?;

    // Install the Prometheus recorder; the handle is served at /metrics
    let metrics_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    tracing::info!("Metrics recorder installed, scrape at /metrics");

    // Create application state
    let state = AppState::new(db_pool, config.clone(), metrics_handle);

    // Create router
    let app = routes::create_router(state);

    // Start server
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
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
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}

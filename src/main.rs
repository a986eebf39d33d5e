use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;

use srag_report::db::{self, PgCaseSource};
use srag_report::pipeline::{CaseSource, JsonLinesCaseSource};
use srag_report::telemetry::init_telemetry;
use srag_report::{AppState, Config, build_orchestrator, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let telemetry_guard = init_telemetry(&config)?;

    tracing::info!(
        port = config.port,
        environment = %config.environment,
        "Starting srag-report-generator"
    );

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required to run the server")?;
    let pool = db::create_pool(database_url).await?;

    let source: Arc<dyn CaseSource> = match &config.data_file {
        Some(path) => Arc::new(JsonLinesCaseSource::new(path)),
        None => Arc::new(PgCaseSource::new(pool.clone())),
    };
    let orchestrator = Arc::new(build_orchestrator(&config, source)?);

    let state = AppState {
        pool,
        config: config.clone(),
        orchestrator,
    };

    let app = routes::router().with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    telemetry_guard.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

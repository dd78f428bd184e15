//! `mviewd` entry point.

use std::sync::Arc;

use daemon::config::Config;
use daemon::error::DaemonError;
use daemon::routes::views::AppState;
use daemon::scheduler::Scheduler;
use metrics_exporter_prometheus::PrometheusHandle;
use mview::{ConfigLoader, PostgresDatabase, ViewProcessor};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn run(config: Config, metrics_handle: PrometheusHandle) -> Result<(), DaemonError> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(DaemonError::MissingDatabaseUrl)?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    let database = PostgresDatabase::new(pool);
    database.migrate().await?;

    let declarations = daemon::load_declarations(&config.mview_config)?;
    let mview_config = ConfigLoader::new().load(&declarations, &database).await?;
    tracing::info!(
        views = mview_config.len(),
        path = %config.mview_config.display(),
        "view declarations loaded"
    );

    let processor = Arc::new(ViewProcessor::new(database, Arc::new(mview_config))?);
    processor.subscribe_all().await?;

    let scheduler = Scheduler::new(
        Arc::clone(&processor),
        config.refresh_interval,
        config.prune_interval,
    );
    let scheduler_task = scheduler.start();

    let app = daemon::create_app(Arc::new(AppState { processor }), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting mviewd");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop();
    if let Err(err) = scheduler_task.await {
        tracing::error!(error = %err, "scheduler task failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Load views and serve until shutdown
    if let Err(err) = run(config, metrics_handle).await {
        tracing::error!(error = %err, "mviewd stopped");
        std::process::exit(1);
    }

    tracing::info!("server shut down gracefully");
}

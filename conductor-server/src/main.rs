//! conductor-server: HTTP entry point for the job controller.
//!
//! One instance fronts one workflow run. Wiring order matters: database
//! pool, registry, cache and adapters first, then the manager, then the
//! monitors, and finally the shutdown coordinator that owns the monitor
//! set. A termination signal runs the same orderly shutdown as the
//! `DELETE /shutdown` endpoint.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use conductor::backends::build_backends;
use conductor::cache::JobCache;
use conductor::config::ControllerConfig;
use conductor::db::JobStore;
use conductor::manager::JobManager;
use conductor::monitor::MonitorSet;
use conductor::registry::JobRegistry;
use conductor::server::{router, AppState};
use conductor::shutdown::ShutdownCoordinator;
use dotenvy::dotenv;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conductor-server")]
#[command(about = "Job controller for one workflow run")]
struct Cli {
    /// Hostname or IP address to bind the server to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Database connection string
    #[arg(short, long, env = "REANA_SQLALCHEMY_DATABASE_URI")]
    database: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(env_filter)
        .init();

    let mut config = ControllerConfig::from_env()?;
    config.host = cli.host;
    config.port = cli.port;
    if let Some(database) = cli.database {
        config.database_uri = database;
    }

    info!(
        "Starting conductor-server version={} backends={:?}",
        env!("CARGO_PKG_VERSION"),
        config.compute_backends
    );

    let connect_options = SqliteConnectOptions::from_str(&config.database_uri)?
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(45));
    let pool = SqlitePoolOptions::new().connect_with(connect_options).await?;
    info!("Connected to database: {}", config.database_uri);

    let store = JobStore::new(pool);
    store.init_schema().await?;

    let registry = Arc::new(JobRegistry::new());
    let cache = JobCache::new(store.clone(), config.cache_enabled);
    let backends = build_backends(&config);
    let manager = Arc::new(JobManager::new(
        config.clone(),
        registry.clone(),
        store.clone(),
        cache.clone(),
        backends.clone(),
    ));
    let monitors = MonitorSet::spawn(&config, registry, store, cache, &backends);
    let coordinator = Arc::new(ShutdownCoordinator::new(
        manager.clone(),
        monitors,
        Duration::from_secs(config.shutdown_deadline_secs),
        config.shutdown_concurrency,
    ));

    let state = Arc::new(AppState {
        manager,
        coordinator: coordinator.clone(),
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;
    Ok(())
}

/// Wait for SIGTERM or ctrl-c, then run the same orderly shutdown as the
/// pre-stop endpoint.
async fn shutdown_signal(coordinator: Arc<ShutdownCoordinator>) {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("could not install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("termination signal received, stopping all jobs");
    if let Err(remaining) = coordinator.shutdown().await {
        tracing::warn!(?remaining, "exiting with jobs still live");
    }
}

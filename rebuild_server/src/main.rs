//! Centrix Rebuild Server: rebuild orchestration service.
//!
//! Receives change-events from the message bus, plans dependency-ordered
//! rebuilds of the affected artifacts, submits them to the configured build
//! systems and tracks them until every event reaches a terminal state.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use centrix_rebuild::clients::{
    BuildSystem, BuildSystems, HttpBuildSystem, HttpMetadata, MetadataService, NoMetadata,
};
use centrix_rebuild::config::RebuildConfig;
use centrix_rebuild::metrics;
use centrix_rebuild::routes::{rebuild_router, RebuildRouterState};
use centrix_rebuild::services::executor::{
    run_bus_consumer, run_notification_consumer, run_timeout_sweeper,
};
use centrix_rebuild::services::publisher::{HttpPublisher, LogPublisher, Publisher};
use centrix_rebuild::services::Services;
use centrix_rebuild::store::{MemoryStore, PgStore, Store};

const QUEUE_DEPTH: usize = 1024;

#[derive(Parser)]
#[command(name = "centrix-rebuild", about = "Centrix Rebuild Orchestrator")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "REBUILD_PORT", default_value = "9090")]
    port: u16,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Database pool size
    #[arg(long, env = "REBUILD_DB_POOL_SIZE", default_value = "10")]
    db_pool_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting Centrix Rebuild Server...");

    let config = Arc::new(RebuildConfig::from_env()?);

    // Store
    let store: Arc<dyn Store> = match cli.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url, cli.db_pool_size)?;
            store.run_migrations().await?;
            tracing::info!("Connected to PostgreSQL");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set -- using in-memory store, state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Collaborators
    let metadata: Arc<dyn MetadataService> = match config.metadata_url.as_deref() {
        Some(url) => Arc::new(HttpMetadata::new(url)),
        None => Arc::new(NoMetadata),
    };
    let build_systems = config
        .build_system_urls
        .iter()
        .fold(BuildSystems::new(), |systems, (kind, url)| {
            tracing::info!(artifact_type = %kind, url = %url, "Build system registered");
            systems.register(*kind, Arc::new(HttpBuildSystem::new(url.as_str())) as Arc<dyn BuildSystem>)
        });
    let publisher: Arc<dyn Publisher> = match config.notify_url.as_deref() {
        Some(url) => Arc::new(HttpPublisher::new(url)),
        None => Arc::new(LogPublisher),
    };

    let services = Services::new(config.clone(), store, publisher, metadata, build_systems);

    // Initialize metrics
    metrics::init_metrics();

    // Control loops
    let (bus_tx, bus_rx) = mpsc::channel(QUEUE_DEPTH);
    let (task_tx, task_rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(run_bus_consumer(
        services.dispatcher.clone(),
        config.clone(),
        bus_tx.clone(),
        bus_rx,
    ));
    tokio::spawn(run_notification_consumer(services.aggregator.clone(), task_rx));
    tokio::spawn(run_timeout_sweeper(services.aggregator.clone(), config.clone()));

    // Pick up events interrupted by the last shutdown
    {
        let scheduler = services.scheduler.clone();
        tokio::spawn(async move {
            match scheduler.resume().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(events = n, "Resumed in-flight events"),
                Err(e) => tracing::error!("Resume failed: {e}"),
            }
        });
    }

    let app = rebuild_router(RebuildRouterState {
        services,
        bus: bus_tx,
        tasks: task_tx,
    });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Centrix Rebuild Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

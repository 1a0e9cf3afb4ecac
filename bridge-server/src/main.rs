use snapshot_bridge::adapters::credentials::TokenProvider;
use snapshot_bridge::adapters::drive::DriveAdapter;
use snapshot_bridge::adapters::supervisor::SupervisorAdapter;
use snapshot_bridge::config::AppConfig;
use snapshot_bridge::db::{connection::close_pool, StateStore};
use snapshot_bridge::routes;
use snapshot_bridge::services::cycle::Engine;
use snapshot_bridge::services::executor::Adapters;
use snapshot_bridge::services::sync_scheduler::{CycleControl, SyncScheduler};
use snapshot_bridge::state::AppState;
use snapshot_bridge::utils::logger;
use snapshot_bridge::ws::events::EventBus;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    logger::init(&config.log_level)?;
    tracing::info!("Starting snapshot bridge on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;

    // Open and migrate the state store
    let store = StateStore::open(&config.db_path)?;
    let known = store.load_catalog().await?;
    tracing::info!(backups = known.len(), "[DB] Loaded last-known catalog");

    // Adapters
    let http = reqwest::Client::builder().timeout(config.request_timeout).build()?;
    let tokens = Arc::new(TokenProvider::open(
        http,
        config.drive_refresh_url.clone(),
        config.drive_client_id.clone(),
        config.credentials_path.clone(),
        config.request_timeout,
    )?);
    let local = SupervisorAdapter::new(
        config.supervisor_url.clone(),
        config.supervisor_token.clone(),
        config.request_timeout,
    )?;
    let remote = DriveAdapter::new(
        config.drive_url.clone(),
        config.drive_folder_id.clone(),
        tokens.clone(),
        config.request_timeout,
    )?;
    let adapters = Adapters::new(Arc::new(local), Arc::new(remote));

    // Engine and scheduler; the startup cycle also resolves anything left in flight
    let engine = Engine::new(adapters, store.clone(), EventBus::new());
    let shutdown = CancellationToken::new();
    let control = CycleControl::new(shutdown.clone());
    let scheduler = SyncScheduler::start(engine.clone(), control.clone());

    let state = Arc::new(AppState::new(config.clone(), engine, control, Some(tokens)));
    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    tracing::info!("Shutting down...");
    scheduler.shutdown().await;

    close_pool(store.pool());
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}

//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{
        CachedHistoryAdapter, DbAdapter, MemoryAdapter, OpenAiAnalysisAdapter, TracingNotifier,
        UnconfiguredAnalysisAdapter,
    },
    config::Config,
    error::ApiError,
    web::{
        analysis_task::{
            analysis_channel, join_background_tasks, run_retry_sweep, AnalysisWorker,
        },
        auth::seed_supervisors,
        build_router,
        state::AppState,
    },
};
use async_openai::{config::OpenAIConfig, Client};
use deal_desk_core::{
    ports::{AnalysisService, DatabaseService},
    settings::SettingsHandle,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Storage & Run Migrations ---
    let db: Arc<dyn DatabaseService> = if config.uses_memory_storage() {
        warn!("DATABASE_URL=memory: selected; all data is lost on exit.");
        Arc::new(MemoryAdapter::new())
    } else {
        info!("Connecting to database...");
        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        let db_adapter = DbAdapter::new(db_pool);
        info!("Running database migrations...");
        db_adapter.run_migrations().await?;
        info!("Database migrations complete.");
        Arc::new(db_adapter)
    };

    // --- 3. Initialize Service Adapters ---
    let analyzer: Arc<dyn AnalysisService> = match config.openai_api_key.as_deref() {
        Some(key) => {
            let client = Client::with_config(OpenAIConfig::new().with_api_key(key));
            Arc::new(OpenAiAnalysisAdapter::new(client, config.analysis_model.clone()))
        }
        None => {
            warn!("OPENAI_API_KEY is not set; AI analysis runs will be recorded as failed.");
            Arc::new(UnconfiguredAnalysisAdapter)
        }
    };
    let (queue, jobs) = analysis_channel(config.analysis_queue_capacity);

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(
        config.clone(),
        db,
        Arc::new(queue),
        Arc::new(TracingNotifier),
    )?);
    let seeded = seed_supervisors(&app_state).await?;
    if seeded > 0 {
        info!("Seeded {} supervisor account(s).", seeded);
    }

    // --- 5. Start Background Work ---
    let shutdown = CancellationToken::new();
    let worker = AnalysisWorker::new(
        app_state.engine.clone(),
        analyzer,
        Arc::new(CachedHistoryAdapter),
        config.analysis_history_limit,
        config.analysis_concurrency,
    );
    let worker_handle = tokio::spawn(worker.run(jobs, shutdown.clone()));
    let sweep_handle = tokio::spawn(run_retry_sweep(
        app_state.engine.clone(),
        Duration::from_secs(config.analysis_retry_interval_seconds),
        shutdown.clone(),
    ));
    spawn_settings_reload(app_state.settings.clone(), shutdown.clone());

    // --- 6. Start the Server ---
    let app = build_router(app_state);
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received.");
        server_shutdown.cancel();
    })
    .await?;

    shutdown.cancel();
    join_background_tasks(vec![
        ("analysis_worker", worker_handle),
        ("analysis_retry_sweep", sweep_handle),
    ])
    .await;
    info!("Server stopped.");
    Ok(())
}

/// Re-reads the environment on SIGHUP and publishes a fresh settings snapshot.
#[cfg(unix)]
fn spawn_settings_reload(settings: SettingsHandle, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Settings reload on SIGHUP is unavailable: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangups.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match Config::reload_from_env().and_then(|c| c.pipeline_settings()) {
                        Ok(fresh) => {
                            settings.replace(fresh);
                            info!("Pipeline settings reloaded.");
                        }
                        Err(e) => error!("Settings reload failed; keeping the current snapshot: {}", e),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_settings_reload(_settings: SettingsHandle, _shutdown: CancellationToken) {}

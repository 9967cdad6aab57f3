use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opsagent_core::catalog::IntentCatalog;
use opsagent_db::{PgStore, Stores};
use opsagent_events::RunEventBus;
use opsagent_pipeline::{AgentOrchestrator, RecoverySweep};
use opsagent_worker::collaborators::{UnavailableBackend, UnavailableParser};
use opsagent_worker::config::{LogFormat, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "opsagent_worker=debug,opsagent_pipeline=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
    tracing::info!(
        stale_run_after_secs = config.stale_run_after.as_secs(),
        sweep_interval_secs = config.recovery_sweep_interval.as_secs(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = opsagent_db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    opsagent_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    opsagent_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Intent catalog ---
    let catalog = match &config.intent_catalog_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read intent catalog {path}"))?;
            IntentCatalog::from_json_str(&json)?
        }
        None => IntentCatalog::purchase_orders(),
    };
    tracing::info!(intents = catalog.len(), "Intent catalog loaded");

    // --- Orchestrator ---
    let orchestrator = Arc::new(AgentOrchestrator::new(
        Stores::from_shared(Arc::new(PgStore::new(pool))),
        Arc::new(UnavailableParser),
        Arc::new(UnavailableBackend),
        Arc::new(catalog),
        RunEventBus::new(),
        config.orchestrator_config(),
    ));

    // --- Recovery sweep ---
    let cancel = CancellationToken::new();
    let sweep = RecoverySweep::new(Arc::clone(&orchestrator));
    let sweep_handle = tokio::spawn(sweep.run(cancel.clone()));

    shutdown_signal().await;

    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), sweep_handle)
        .await
        .is_err()
    {
        tracing::warn!("Recovery sweep did not stop within 5s");
    }
    tracing::info!("Worker shut down");
    Ok(())
}

/// Wait for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

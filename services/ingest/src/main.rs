//! Staffing-plan ingestion service.
//!
//! Receives employee lifecycle webhooks from the HR system, keeps the
//! staffing table's actual headcount in step with them, and runs bulk
//! normalization and reprocessing jobs.

use anyhow::Result;
use lotacao_ingest::{
    api,
    config::{self, StorageBackend},
    db::Database,
    resolver::RuleTable,
    state::{AppState, StateOptions, Stores},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOTACAO_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting lotacao ingest service");
    info!(listen_addr = %config.listen_addr, storage = ?config.storage, "Configuration loaded");

    let rules = match &config.rules_path {
        Some(path) => match RuleTable::load(path) {
            Ok(rules) => {
                info!(path = %path.display(), "Loaded discrepancy rules");
                rules
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to load discrepancy rules");
                return Err(e.into());
            }
        },
        None => RuleTable::default(),
    };

    let (stores, db) = match config.storage {
        StorageBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            // Run migrations in dev mode
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            (Stores::postgres(&db), Some(db))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all data is lost on restart");
            (Stores::memory(), None)
        }
    };

    let state = AppState::new(
        stores,
        StateOptions {
            webhook_secret: config.webhook_secret.clone(),
            retry: config.retry,
            scheduler: config.scheduler.clone(),
            job_max_attempts: config.job_max_attempts,
            rules,
        },
        db,
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start job scheduler in background
    let scheduler = state.scheduler().clone();
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler.run(shutdown_rx).await;
        }
    });

    // Start cleanup worker in background
    let cleanup_worker = state.cleanup_worker(config.cleanup.clone());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup_worker.run(shutdown_rx).await;
        }
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Job scheduler did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, cleanup_handle).await {
        warn!(error = %e, "Cleanup worker did not shut down in time");
    }

    info!("Ingest service shutdown complete");
    Ok(())
}

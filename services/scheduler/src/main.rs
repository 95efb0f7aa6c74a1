//! lookout check scheduler
//!
//! Periodically scans pipeline resources, creates checks for the ones that are
//! due, and dispatches those checks to the execution engine at a bounded rate.

use std::sync::Arc;

use anyhow::Result;
use lookout_pacing::{notifier, RateCalculator};
use lookout_scheduler::{
    config::{self, StoreKind},
    db::Database,
    engine::HttpEngine,
    lidar::{Checker, CheckerConfig, Orchestrator, OrchestratorConfig, Scanner, ScannerConfig},
    store::{CheckStore, MemoryCheckStore, PgCheckStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOOKOUT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting lookout scheduler");
    info!(
        store = ?config.store,
        max_checks_per_second = ?config.max_checks_per_second,
        persist_checks = config.persist_checks,
        check_timeout = %humantime::format_duration(config.global_resource_check_timeout),
        executor_url = %config.executor_url,
        "Configuration loaded"
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (check_notifier, check_notifications) = notifier();

    let (store, listener_handle) = match config.store {
        StoreKind::Memory => {
            warn!("Using in-memory check store; state is lost on restart");
            let store = MemoryCheckStore::new().with_checker_notifier(check_notifier);
            (Arc::new(store) as Arc<dyn CheckStore>, None)
        }
        StoreKind::Postgres => {
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

            let store = PgCheckStore::new(db.pool().clone());
            let handle = store
                .listen_checker(check_notifier, shutdown_rx.clone())
                .await?;
            (Arc::new(store) as Arc<dyn CheckStore>, Some(handle))
        }
    };

    let engine = Arc::new(HttpEngine::new(config.executor_url.clone(), store.clone())?);

    let scanner = Scanner::new(
        store.clone(),
        ScannerConfig {
            default_check_interval: config.resource_checking_interval,
            default_webhook_check_interval: config.resource_with_webhook_checking_interval,
            check_timeout: config.global_resource_check_timeout,
            persist_checks: config.persist_checks,
        },
    );

    let checker = Checker::new(
        store.clone(),
        engine,
        RateCalculator::new(
            config.max_checks_per_second,
            config.resource_checking_interval,
            store.clone(),
        ),
        CheckerConfig {
            limiter_refresh_interval: config.rate_refresh_interval,
            claim_lease: config.claim_lease(),
        },
    );

    let orchestrator = Orchestrator::new(
        scanner,
        checker,
        OrchestratorConfig {
            scan_interval: config.scanner_interval,
            check_interval: config.checker_interval,
        },
        check_notifications,
    );

    // Start the scan and check loops in background
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");

    if let Err(e) = tokio::time::timeout(config.shutdown_timeout, orchestrator_handle).await {
        warn!(error = %e, "Check loops did not shut down in time");
    }

    if let Some(handle) = listener_handle {
        if let Err(e) = tokio::time::timeout(config.shutdown_timeout, handle).await {
            warn!(error = %e, "Checker notification listener did not shut down in time");
        }
    }

    info!("Scheduler shutdown complete");
    Ok(())
}

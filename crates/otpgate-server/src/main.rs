//! OtpGate - SMS/OTP gateway entry point

use anyhow::{anyhow, Result};
use otpgate_api::auth::provision_api_key;
use otpgate_api::AppState;
use otpgate_common::config::{Config, DatabaseBackend, LoggingConfig};
use otpgate_core::delivery::{run_sweeper, spawn_tracker, DispatcherConfig, WebhookDispatcher};
use otpgate_core::{Gateway, LoggingOperatorLink};
use otpgate_storage::{DatabasePool, NewAccount, Repositories};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var_os("OTPGATE_CONFIG").map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting OtpGate...");

    // Initialize storage
    let repos = match config.database.backend {
        DatabaseBackend::Postgres => {
            let db_pool = DatabasePool::new(&config.database).await?;
            info!("Database connection established");

            db_pool.migrate().await?;
            info!("Database migrations completed");

            Repositories::postgres(db_pool)
        }
        DatabaseBackend::Memory => {
            warn!("Using in-memory storage; all data is lost on restart");
            Repositories::memory()
        }
    };

    seed_accounts(&repos, &config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start webhook dispatcher
    let (callback_tx, callback_rx) = mpsc::channel(config.delivery.tracker_buffer.max(1));
    let dispatcher = Arc::new(WebhookDispatcher::new(
        repos.messages.clone(),
        DispatcherConfig::from(&config.delivery),
    )?);
    let dispatcher_handle = tokio::spawn(dispatcher.run(callback_rx, shutdown_rx.clone()));

    // Start delivery tracker
    let expiry = i64::try_from(config.delivery.expiry_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .ok_or_else(|| anyhow!("delivery.expiry_hours is out of range"))?;
    let (tracker, tracker_handle) = spawn_tracker(
        repos.messages.clone(),
        callback_tx,
        expiry,
        config.delivery.tracker_buffer,
        shutdown_rx.clone(),
    );

    // Start expiry sweeper
    let sweeper_handle = tokio::spawn(run_sweeper(
        tracker.clone(),
        Duration::from_secs(config.delivery.sweep_interval_secs),
        shutdown_rx.clone(),
    ));

    let gateway = Gateway::new(&repos, &config, tracker, Arc::new(LoggingOperatorLink))?;
    info!(prefixes = gateway.rates().len(), "Rate table loaded");

    // Start API server
    let bind = format!("{}:{}", config.server.bind_address, config.api.port);
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let state = AppState {
        gateway: Arc::new(gateway),
        repos,
        config: Arc::new(config),
    };
    let app = otpgate_api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Starting API server on {}", bind);

    let api_handle = {
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("OtpGate started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let tasks: [(&str, JoinHandle<()>); 4] = [
        ("api", api_handle),
        ("sweeper", sweeper_handle),
        ("tracker", tracker_handle),
        ("dispatcher", dispatcher_handle),
    ];
    for (name, handle) in tasks {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!(task = name, "Task did not stop within the grace period");
        }
    }

    info!("OtpGate shutdown complete");

    Ok(())
}

/// Create the configured seed accounts and their API keys
async fn seed_accounts(repos: &Repositories, config: &Config) -> Result<()> {
    if config.seed.accounts.is_empty() {
        return Ok(());
    }
    if config.database.backend != DatabaseBackend::Memory {
        warn!("Ignoring seed accounts; seeding only applies to the memory backend");
        return Ok(());
    }

    for seed in &config.seed.accounts {
        let account = repos
            .accounts
            .create(NewAccount {
                id: seed.id.unwrap_or_else(Uuid::new_v4),
                name: seed.name.clone(),
                balance: seed.balance,
                credit_limit: seed.credit_limit,
                currency: seed
                    .currency
                    .clone()
                    .unwrap_or_else(|| config.messaging.default_currency.clone()),
                rate_limit_rps: seed.rate_limit_rps,
                allowed_ips: seed.allowed_ips.clone(),
            })
            .await?;
        provision_api_key(repos, account.id, "seed", &seed.api_key).await?;
        info!(account_id = %account.id, name = %account.name, "Seeded account");
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

//! MailAggregator: self-hosted multi-account IMAP aggregator.
//!
//! Polls IMAP mailboxes on per-account schedules, persists every newly
//! observed message exactly once, classifies it through an ordered rule
//! list, and fans matched notifications out to Telegram and a generic
//! webhook. An HTTP/JSON control plane manages accounts, rules,
//! settings, and statistics.
//!
//! ## Module Organization
//!
//! - `adapters/`: IMAP and SQLite adapter layers
//! - `services/`: fetch pipeline, scheduler, rule engine, delivery
//! - `api/`: axum handlers (thin wrappers over services and the store)
//! - `config/`: environment bootstrap
//! - `encryption/`: credential cipher

pub mod adapters;
pub mod api;
pub mod config;
pub mod encryption;
pub mod error;
pub mod services;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::adapters::sqlite;
use crate::api::auth::AuthState;
use crate::api::AppState;
use crate::config::BootConfig;
use crate::encryption::SecretCipher;
use crate::error::Result;
use crate::services::fetcher::Pipeline;
use crate::services::settings::SettingsCache;
use crate::services::scheduler;

/// Boot the service: store, settings cache, scheduler, HTTP listener.
/// Runs until SIGINT/SIGTERM, then drains poll loops with the
/// scheduler's grace period.
pub async fn run() -> Result<()> {
    let boot = BootConfig::from_env()?;
    let cipher = Arc::new(SecretCipher::from_key(&boot.encryption_key)?);

    let pool = sqlite::pool::create_pool(&boot.database_path)?;
    {
        let conn = pool.get()?;
        sqlite::schema::initialize_schema(&conn)?;
    }
    info!(path = %boot.database_path.display(), "Store ready");

    let settings = Arc::new(SettingsCache::new(boot.clone()));
    settings.reload(&pool).await?;

    let pipeline = Arc::new(Pipeline::new(
        pool,
        cipher,
        settings,
        reqwest::Client::new(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scheduler_handle, scheduler_join) = scheduler::start(pipeline.clone(), shutdown_rx);

    let state = AppState {
        pipeline,
        scheduler: scheduler_handle,
        auth: Arc::new(AuthState::new(&boot)),
        database_path: Arc::new(boot.database_path.clone()),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&boot.listen_addr)
        .await
        .map_err(|e| {
            crate::error::Error::Config(format!("cannot bind {}: {}", boot.listen_addr, e))
        })?;
    info!(addr = %boot.listen_addr, "HTTP control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| crate::error::Error::Config(format!("server error: {}", e)))?;

    // Stop accepting new wakes, then give in-flight polls their grace.
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_join.await {
        error!(error = %e, "Scheduler task panicked");
    }
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

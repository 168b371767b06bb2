//! # Formlink Bridge
//!
//! Polling daemon that mirrors Formlabs cloud printers as entity snapshots.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Formlink Bridge                                  │
//! │                                                                         │
//! │  bridge.toml + FORMLINK_* ──► BridgeConfig ──► PollingAgent            │
//! │                                                    │                    │
//! │                                                    ▼                    │
//! │                                  Formlabs cloud ◄── CloudClient         │
//! │                                                    │                    │
//! │                                                    ▼                    │
//! │                                              LogEmitter                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `formlink-bridge [CONFIG_PATH]` (or `FORMLINK_CONFIG`).

mod emitter;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use formlink_cloud::{BridgeConfig, CloudClient, PollingAgentBuilder, PollingAgentHandle, TokenManager};

use crate::emitter::LogEmitter;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,formlink=debug";

const CONFIG_PATH_ENV: &str = "FORMLINK_CONFIG";

/// Upper bound on waiting for the last refresh token write at shutdown.
const PERSIST_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_target(true)
        .init();

    info!("Starting Formlink bridge...");

    // Load configuration
    let config_path = config_path(std::env::args().nth(1), std::env::var(CONFIG_PATH_ENV).ok());
    let config = BridgeConfig::load(config_path.clone())?;
    info!(
        base_url = %config.api.base_url,
        interval_secs = config.polling.interval_secs,
        stale_after_failures = config.polling.stale_after_failures,
        thumbnails = config.thumbnails.enabled,
        "Configuration loaded"
    );

    // Shared connection pool for API and token calls
    let http = reqwest::Client::builder()
        .user_agent(concat!("formlink-bridge/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let tokens = Arc::new(TokenManager::from_config(http.clone(), &config)?);
    let persister = tokio::spawn(persist_rotated_refresh_tokens(
        tokens.subscribe_refresh_token(),
        config.clone(),
        config_path,
    ));
    let client = Arc::new(CloudClient::from_config(
        http,
        &config,
        tokens.clone(),
        config.normalizer(),
    )?);

    let handle = PollingAgentBuilder::from_config(client, &config)
        .with_emitter(Arc::new(LogEmitter))
        .build()
        .start()
        .await?;

    tokio::select! {
        _ = shutdown_signal() => {},
        _ = agent_stopped(&handle) => {
            warn!("Polling agent stopped on its own");
        },
    }

    handle.shutdown().await;

    // Last token owner gone: the persister sees the channel close and exits.
    drop(tokens);
    if tokio::time::timeout(PERSIST_FLUSH_TIMEOUT, persister).await.is_err() {
        warn!("Timed out waiting for refresh token persistence");
    }

    info!("Bridge shutdown complete");
    Ok(())
}

/// CLI argument wins over the environment; `None` means the default path.
fn config_path(arg: Option<String>, env: Option<String>) -> Option<PathBuf> {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
}

/// Resolves once the poll loop has exited (e.g. after losing authorization).
async fn agent_stopped(handle: &PollingAgentHandle) {
    let mut check = tokio::time::interval(Duration::from_secs(1));
    loop {
        check.tick().await;
        if handle.is_finished() {
            return;
        }
    }
}

/// The vendor may rotate the refresh token on every grant and revoke the
/// old one. Writes each rotation back as it happens so a crash or restart
/// can still authenticate. Returns once the token manager is dropped.
async fn persist_rotated_refresh_tokens(
    mut rotations: watch::Receiver<Option<String>>,
    mut config: BridgeConfig,
    config_path: Option<PathBuf>,
) {
    while rotations.changed().await.is_ok() {
        let rotated = rotations.borrow_and_update().clone();
        if rotated.is_none() || rotated == config.auth.refresh_token {
            continue;
        }

        config.auth.refresh_token = rotated;
        match config.save(config_path.clone()) {
            Ok(()) => info!("Persisted rotated refresh token"),
            Err(err) => error!(error = %err, "Failed to persist rotated refresh token"),
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}

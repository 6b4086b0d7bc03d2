mod commands;
mod config;
mod lock;
mod provider;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colony_save_core::{Clock, LockManager, SystemClock};
use colony_save_engine::SlotStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use lock::FileLock;
use storage::FileKv;

const LOCK_TTL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let save_dir = config.effective_save_dir();

    info!("Starting colony-save");
    info!("  Save dir: {}", save_dir.display());
    info!("  Profile: {}", config.profile);

    // One process per profile: a second instance would race on the index
    let lock_manager = FileLock::new(&save_dir);
    let holder = commands::lock_holder();
    let lock = lock_manager
        .acquire(&config.profile, commands::PROFILE_LOCK, &holder, LOCK_TTL)
        .await?;
    if !lock.acquired {
        anyhow::bail!(
            "profile '{}' is in use by another colony-save process",
            config.profile
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let kv = Arc::new(FileKv::new(config.profile_dir()));
    let result = match SlotStore::open(kv, config.layout(), clock.clone()).await {
        Ok(store) => {
            let shutdown_rx = create_shutdown_signal();
            commands::run(&config, store, clock, shutdown_rx).await
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = lock_manager
        .release(&config.profile, commands::PROFILE_LOCK, &holder)
        .await
    {
        warn!("Failed to release profile lock: {}", e);
    }
    result
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
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

        let _ = tx.send(true);
    });

    rx
}

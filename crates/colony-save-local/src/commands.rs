use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use colony_save_cloud::{RestAuthProvider, RestConfig, RestRemoteBackend};
use colony_save_core::{AuthProvider, Clock};
use colony_save_engine::{
    AutoSaveScheduler, Connectivity, LoadOutcome, SaveReceipt, SlotStore, SyncEngine, Trigger,
    TriggerOutcome,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Command, Config};
use crate::provider::{read_snapshot, FileSnapshotProvider};

/// Run one subcommand against an opened store.
pub async fn run(
    config: &Config,
    store: SlotStore,
    clock: Arc<dyn Clock>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    match &config.command {
        Command::Slots => print_json(&store.list_slots().await),
        Command::Usage => print_json(&store.storage_usage().await),
        Command::Save { slot, file } => {
            let snapshot = read_snapshot(file)
                .await?
                .ok_or_else(|| anyhow!("snapshot file {} not found", file.display()))?;
            let receipt = store.save(&snapshot, *slot).await?;
            print_json(&receipt_json(&receipt))
        }
        Command::Load { slot, out } => {
            let outcome = store.load(*slot).await?;
            report_load(&outcome);
            match out {
                Some(path) => {
                    let bytes = serde_json::to_vec_pretty(&outcome.snapshot)?;
                    tokio::fs::write(path, bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote slot {} to {}", slot, path.display());
                    Ok(())
                }
                None => print_json(&outcome.snapshot),
            }
        }
        Command::Delete { slot } => {
            let existed = store.delete(*slot).await?;
            print_json(&json!({ "slot_id": slot, "deleted": existed }))
        }
        Command::Export { slot, out } => {
            let blob = store.export_slot(*slot).await?;
            tokio::fs::write(out, &blob)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            print_json(&json!({ "slot_id": slot, "bytes": blob.len(), "path": out }))
        }
        Command::Import { slot, file } => {
            let blob = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let receipt = store.import_slot(*slot, &blob).await?;
            print_json(&receipt_json(&receipt))
        }
        Command::Sync => sync(config, store, clock).await,
        Command::Autosave {
            file,
            shutdown_timeout_secs,
            ..
        } => {
            let auto = config
                .auto_save()
                .ok_or_else(|| anyhow!("auto-save settings missing"))?;
            let scheduler =
                AutoSaveScheduler::new(store, Arc::new(FileSnapshotProvider::new(file)), auto)?;
            autosave(
                scheduler,
                shutdown_rx,
                Duration::from_secs(*shutdown_timeout_secs),
            )
            .await
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn receipt_json(receipt: &SaveReceipt) -> Value {
    json!({
        "slot_id": receipt.slot_id,
        "save_id": receipt.save_id,
        "bytes": receipt.bytes,
        "raw_size": receipt.raw_size,
        "compressed": receipt.compressed,
        "last_saved": receipt.last_saved,
    })
}

fn report_load(outcome: &LoadOutcome) {
    if outcome.migration_applied {
        info!("Save was migrated from an older version");
    }
    if outcome.repaired {
        warn!("Save was repaired: {}", outcome.repair_log.join("; "));
    }
    for warning in &outcome.warnings {
        warn!("{}", warning);
    }
}

async fn sync(config: &Config, store: SlotStore, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let url = config
        .remote_url
        .clone()
        .ok_or_else(|| anyhow!("--remote-url (COLONY_REMOTE_URL) is required for sync"))?;
    let api_key = config
        .remote_api_key
        .clone()
        .ok_or_else(|| anyhow!("--remote-api-key (COLONY_REMOTE_API_KEY) is required for sync"))?;
    let (Some(email), Some(password)) = (&config.email, &config.password) else {
        anyhow::bail!("--email and --password (COLONY_EMAIL, COLONY_PASSWORD) are required for sync");
    };

    let rest = RestConfig::new(url, api_key);
    let remote = Arc::new(RestRemoteBackend::new(rest.clone())?);
    let auth = Arc::new(RestAuthProvider::new(rest)?);
    auth.sign_in(email, password).await?;

    let engine = SyncEngine::new(store, remote, auth.clone(), Connectivity::new(true), clock);
    let report = engine.reconcile().await;
    if let Err(e) = auth.sign_out().await {
        warn!("Sign-out failed: {}", e);
    }
    let report = report?;

    info!(
        "Sync finished: {} uploaded, {} downloaded, {} failed",
        report.uploaded(),
        report.downloaded(),
        report.failed().count()
    );
    let outcomes: Vec<Value> = report
        .outcomes
        .iter()
        .map(|o| {
            json!({
                "slot_id": o.slot_id,
                "action": o.action,
                "error": o.error.as_ref().map(|e| e.to_string()),
            })
        })
        .collect();
    print_json(&outcomes)
}

/// Drive the scheduler from stdin until EOF or a shutdown signal.
///
/// Accepted lines: `event <name>`, `hidden`, `visible`, `save`, `status`.
async fn autosave(
    scheduler: AutoSaveScheduler,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_timeout: Duration,
) -> anyhow::Result<()> {
    scheduler.start();
    info!(
        "Auto-save running every {} minutes",
        scheduler.config().interval_minutes
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|&v| v) => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = handle_line(&scheduler, line.trim()).await {
                    warn!("{}", e);
                }
            }
        }
    }

    match scheduler.shutdown(shutdown_timeout).await {
        Ok(outcome) => log_outcome("shutdown", &outcome),
        Err(e) => warn!("Final save failed: {}", e),
    }
    Ok(())
}

async fn handle_line(scheduler: &AutoSaveScheduler, line: &str) -> anyhow::Result<()> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (None, _) => {}
        (Some("event"), Some(name)) => scheduler.notify_event(name)?,
        (Some("hidden"), None) => {
            if let Some(outcome) = scheduler.on_visibility_change(false).await? {
                log_outcome("visibility", &outcome);
            }
        }
        (Some("visible"), None) => {
            scheduler.on_visibility_change(true).await?;
        }
        (Some("save"), None) => {
            let outcome = scheduler.trigger(Trigger::Manual).await?;
            log_outcome("manual", &outcome);
        }
        (Some("status"), None) => print_json(&scheduler.status())?,
        _ => anyhow::bail!("unrecognized command '{}'", line),
    }
    Ok(())
}

fn log_outcome(source: &str, outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Saved(receipt) => info!(
            "Auto-save ({}) wrote slot {} ({} bytes)",
            source, receipt.slot_id, receipt.bytes
        ),
        other => info!("Auto-save ({}): {:?}", source, other),
    }
}

/// Lock resource guarding a profile against concurrent processes.
pub const PROFILE_LOCK: &str = "profile";

pub fn lock_holder() -> String {
    format!("pid-{}", std::process::id())
}

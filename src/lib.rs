//! # ac-sync
//!
//! End-to-end encrypted replication of a local project dataset across
//! Google Drive and OneDrive app folders, with no server of its own.

pub mod db;
pub mod sync;

use clap::{Parser, Subcommand};
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sync::provider::google::GOOGLE_API_BASE_URL;
use sync::provider::onedrive::GRAPH_API_BASE_URL;
use sync::snapshot::local_watermark;
use sync::{
    GoogleDriveAdapter, OneDriveAdapter, ProjectStore, ProviderAdapter, ProviderError,
    PullOutcome, SchedulerError, Secret, StatusChannel, SyncConfig, SyncError, SyncOrchestrator,
    SyncRole, SyncScheduler,
};

/// Origin used by the binary's own status view
const CLI_VIEW_ORIGIN: &str = "cli";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Db(#[from] db::DbError),

    #[error("{0}")]
    Sync(#[from] SyncError),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("No provider configured: set GOOGLE_DRIVE_TOKEN and/or ONEDRIVE_TOKEN")]
    NoProviderConfigured,

    #[error("Runtime error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Command Line
// ============================================================================

/// Encrypted multi-provider project sync
#[derive(Parser, Debug)]
#[command(name = "ac-sync", version, about = "End-to-end encrypted project sync")]
pub struct Cli {
    /// SQLite database path (defaults to the platform data directory)
    #[arg(long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Keep syncing until Ctrl-C (default)
    Watch,

    /// Publish the local dataset now
    Push,

    /// Fetch and apply the newest remote snapshot
    Pull,

    /// Make this device the owner of the data
    TakeControl,

    /// Print status and provider states as JSON
    Status,
}

/// Provider adapters for every token present in the environment, Google first
pub fn adapters_from_env<F>(
    config: &SyncConfig,
    lookup: F,
) -> Result<Vec<Arc<dyn ProviderAdapter>>, ProviderError>
where
    F: Fn(&str) -> Option<String>,
{
    let token = |key: &str| lookup(key).map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    if let Some(token) = token("GOOGLE_DRIVE_TOKEN") {
        adapters.push(Arc::new(GoogleDriveAdapter::with_base_url(
            Arc::new(sync::StaticToken::new(token)),
            GOOGLE_API_BASE_URL,
            &config.file_name,
        )?));
    }
    if let Some(token) = token("ONEDRIVE_TOKEN") {
        adapters.push(Arc::new(OneDriveAdapter::with_base_url(
            Arc::new(sync::StaticToken::new(token)),
            GRAPH_API_BASE_URL,
            &config.file_name,
        )?));
    }

    Ok(adapters)
}

/// Identifier + passphrase from `AC_SYNC_IDENTIFIER` / `AC_SYNC_PASSPHRASE`
pub fn secret_from_env<F>(lookup: F) -> Option<Secret>
where
    F: Fn(&str) -> Option<String>,
{
    let identifier = lookup("AC_SYNC_IDENTIFIER").filter(|v| !v.trim().is_empty())?;
    let passphrase = lookup("AC_SYNC_PASSPHRASE").filter(|v| !v.is_empty())?;
    Some(Secret::new(identifier.trim(), passphrase))
}

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() -> Result<(), AppError> {
    // Load .env for provider tokens and credentials
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let db_path = match cli.db {
        Some(path) => path,
        None => db::default_db_path()?,
    };
    log::info!("Database path: {:?}", db_path);
    let db = Arc::new(Database::new(db_path)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli.command.unwrap_or(Command::Watch), db))
}

async fn execute(command: Command, db: Arc<Database>) -> Result<(), AppError> {
    let config = SyncConfig::from_env();
    let env = |key: &str| std::env::var(key).ok();

    let adapters = adapters_from_env(&config, env)?;
    if adapters.is_empty() {
        return Err(AppError::NoProviderConfigured);
    }
    let provider_ids: Vec<String> = adapters.iter().map(|a| a.id().to_string()).collect();

    let orchestrator = SyncOrchestrator::new(config, db.clone(), db.clone(), adapters);

    // Credentials first so enabling can open an existing backup right away
    match secret_from_env(env) {
        Some(secret) => {
            orchestrator.set_credentials(secret).await?;
        }
        None => log::warn!("AC_SYNC_IDENTIFIER / AC_SYNC_PASSPHRASE not set"),
    }

    for id in &provider_ids {
        if let Err(e) = orchestrator.enable_provider(id).await {
            log::error!("Could not enable {}: {}", id, e);
        }
    }

    match command {
        Command::Status => print_status(&orchestrator).await,
        Command::Push => {
            if orchestrator.role().await != SyncRole::Active {
                log::warn!("Another device owns the data; use take-control to publish");
            }
            match orchestrator.push_now().await? {
                Some(report) => log::info!(
                    "Push finished: {} written, {} failed, {} conflicted",
                    report.written.len(),
                    report.failed.len(),
                    report.conflicted.len()
                ),
                None => log::info!("Nothing pushed"),
            }
            print_status(&orchestrator).await
        }
        Command::Pull => {
            match orchestrator.pull_now().await? {
                PullOutcome::Applied { provider, report } => log::info!(
                    "Applied snapshot from {}: {} created, {} updated, {} deleted",
                    provider,
                    report.created,
                    report.updated,
                    report.deleted
                ),
                other => log::info!("Pull finished: {:?}", other),
            }
            print_status(&orchestrator).await
        }
        Command::TakeControl => {
            let report = orchestrator.take_control().await?;
            log::info!("Took control on {}", report.written.join(", "));
            print_status(&orchestrator).await
        }
        Command::Watch => watch(orchestrator, db).await,
    }
}

async fn print_status(orchestrator: &SyncOrchestrator) -> Result<(), AppError> {
    let status = orchestrator.status().await;
    let providers = orchestrator.provider_states().await;
    let out = serde_json::json!({
        "deviceId": orchestrator.device_id(),
        "role": orchestrator.role().await,
        "status": status,
        "providers": providers.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Run the scheduler until Ctrl-C, feeding it local changes seen in the database
async fn watch(orchestrator: SyncOrchestrator, db: Arc<Database>) -> Result<(), AppError> {
    let scheduler = SyncScheduler::new(orchestrator.clone());
    let handle = scheduler.start()?;

    // Mirror engine status the way another view would
    let mut view = StatusChannel::join(&orchestrator.config().status_channel, CLI_VIEW_ORIGIN)
        .subscribe();
    let mirror = tokio::spawn(async move {
        while let Some(message) = view.recv().await {
            println!("[{}] {}: {}", message.origin, message.mode, message.detail);
        }
    });

    // The dataset is edited by other processes; detect changes by fingerprint
    let mut fingerprint = dataset_fingerprint(db.as_ref());
    if orchestrator.role().await == SyncRole::Active {
        handle.local_change();
    }

    let mut ticker =
        tokio::time::interval(Duration::from_millis(orchestrator.config().poll_visible_ms));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let current = dataset_fingerprint(db.as_ref());
                if current != fingerprint {
                    log::debug!("Local dataset changed");
                    fingerprint = current;
                    handle.local_change();
                }
            }
        }
    }

    handle.shutdown();
    scheduler.join().await;
    mirror.abort();
    Ok(())
}

/// Record count and newest `updatedAt`; `None` when the store cannot be read
fn dataset_fingerprint(store: &dyn ProjectStore) -> Option<(usize, i64)> {
    let count = store.list_projects().ok()?.len();
    let newest = local_watermark(store).ok()?;
    Some((count, newest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["ac-sync", "take-control"]).unwrap();
        assert_eq!(cli.command, Some(Command::TakeControl));

        let cli = Cli::try_parse_from(["ac-sync", "--db", "/tmp/x.db"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));

        assert!(Cli::try_parse_from(["ac-sync", "merge"]).is_err());
    }

    #[test]
    fn test_adapters_from_env_order() {
        let config = SyncConfig::default();
        let adapters = adapters_from_env(
            &config,
            lookup(&[("ONEDRIVE_TOKEN", "od"), ("GOOGLE_DRIVE_TOKEN", "gd")]),
        )
        .unwrap();
        let ids: Vec<&str> = adapters.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec!["google", "onedrive"]);

        let adapters = adapters_from_env(&config, lookup(&[("GOOGLE_DRIVE_TOKEN", "  ")])).unwrap();
        assert!(adapters.is_empty());
    }

    #[test]
    fn test_secret_from_env() {
        assert!(secret_from_env(lookup(&[("AC_SYNC_IDENTIFIER", "11987654321")])).is_none());

        let secret = secret_from_env(lookup(&[
            ("AC_SYNC_IDENTIFIER", " 11987654321 "),
            ("AC_SYNC_PASSPHRASE", "correct horse battery"),
        ]))
        .unwrap();
        assert_eq!(secret.identifier(), "11987654321");
    }

    #[test]
    fn test_dataset_fingerprint_tracks_changes() {
        let db = Database::in_memory().unwrap();
        let before = dataset_fingerprint(&db);
        assert_eq!(before, Some((0, 0)));

        db.insert_project("p1", &serde_json::json!({ "updatedAt": 7 }))
            .unwrap();
        assert_eq!(dataset_fingerprint(&db), Some((1, 7)));
    }
}

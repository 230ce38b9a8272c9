//! clinisync-agent
//!
//! Runs the sync engine against a remote endpoint until interrupted.
//!
//! Environment:
//! - CLINISYNC_REMOTE_URL (required): base URL of the remote sync endpoint
//! - CLINISYNC_API_TOKEN: bearer token attached to every push
//! - CLINISYNC_DB_PATH: database file (default: platform data directory)
//! - CLINISYNC_STATUS_INTERVAL_SECS: status log interval (default: 60)
//! - CLINISYNC_*: configuration overrides, see `SyncConfig::apply_env`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clinisync::{Database, HttpSyncEndpoint, SyncConfig, SyncManager};

const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = database_path()?;
    log::info!("Database path: {:?}", db_path);

    let db = Arc::new(Database::new(db_path)?);
    let config = SyncConfig::load(&db)?.apply_env()?;

    let remote_url = std::env::var("CLINISYNC_REMOTE_URL")
        .map_err(|_| "CLINISYNC_REMOTE_URL is not set")?;
    let mut endpoint = HttpSyncEndpoint::new(&remote_url, config.request_timeout())?;
    if let Ok(token) = std::env::var("CLINISYNC_API_TOKEN") {
        endpoint = endpoint.with_token(token);
    }

    let manager = SyncManager::with_defaults(config, db, Arc::new(endpoint))?;
    manager.start().await?;
    log::info!("Syncing with {}", remote_url);

    let status_every = std::env::var("CLINISYNC_STATUS_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS);
    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => match manager.status() {
                Ok(status) => log::info!(
                    "Sync {}: {} queued, {} in flight, {} failed, last sync {}",
                    status.state.as_str(),
                    status.queue_depth,
                    status.in_flight,
                    status.failed_count,
                    status
                        .last_sync_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                ),
                Err(e) => log::warn!("Failed to read sync status: {}", e),
            }
        }
    }

    manager.shutdown().await?;
    Ok(())
}

fn database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("CLINISYNC_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let dirs = directories::ProjectDirs::from("com", "clinisync", "clinisync")
        .ok_or("Failed to get app directories - cannot determine data location")?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("clinisync.db"))
}
